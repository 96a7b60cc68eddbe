use std::io::Write;
use std::path::Path;

/// Replace `path` with `contents` without ever exposing a partial file.
///
/// The bytes go to a temporary file in the same directory, are flushed to
/// disk and then renamed over the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs_err::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".podcaster-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Split a Markdown document into its YAML front matter and body.
///
/// Returns `None` for the header when the document does not start with a
/// `---` fence or the closing fence is missing.
pub fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let rest = match content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
    {
        Some(rest) => rest,
        None => return (None, content),
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(header), body);
        }
        offset += line.len();
    }

    (None, content)
}

/// Render a YAML header and body as a front-matter document
pub fn join_front_matter(header_yaml: &str, body: &str) -> String {
    let mut out = String::with_capacity(header_yaml.len() + body.len() + 8);
    out.push_str("---\n");
    out.push_str(header_yaml);
    if !header_yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("---\n");
    out.push_str(body);
    out
}

/// Format seconds as `HH:MM:SS`
pub fn format_timestamp(seconds: f64) -> String {
    let total_seconds = seconds.max(0.0) as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

/// Format duration in human-readable format
pub fn format_duration(seconds: f64) -> String {
    let total_seconds = seconds as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Sanitize filename for safe filesystem and URL usage
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            c if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' || c == '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Turn a file stem like `01_intro-to_ownership` into `01 Intro To Ownership`
pub fn title_from_stem(stem: &str) -> String {
    stem.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last `max_chars` characters of `text`, cut on a char boundary
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[start..]
}

/// Truncate long text for log lines and descriptions
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

/// Check if the current environment has the external tools the stages call
pub async fn check_dependencies() -> Vec<String> {
    let mut missing = Vec::new();

    if !check_command_available("ffmpeg", "-version").await {
        missing.push("ffmpeg - required for audio extraction".to_string());
    }

    if !check_command_available("ffprobe", "-version").await {
        missing.push("ffprobe - required for timestamp generation".to_string());
    }

    if !check_command_available("edge-tts", "--help").await {
        missing.push("edge-tts - required for narration".to_string());
    }

    if !check_command_available("git", "--version").await {
        missing.push("git - required for publishing the feed".to_string());
    }

    missing
}

/// Check if a command is available in PATH
async fn check_command_available(command: &str, version_arg: &str) -> bool {
    use tokio::process::Command;

    Command::new(command)
        .arg(version_arg)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}
