//! Numbered interactive menu. Each choice maps onto one of the regular
//! subcommands so the menu and the command line share a single code path.

use anyhow::Result;
use console::{style, Term};
use std::path::PathBuf;

use super::Commands;
use crate::item::Stage;

/// What the operator picked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuChoice {
    Stage(Stage),
    FullPipeline,
    Status,
    Settings,
    Quit,
}

impl MenuChoice {
    /// Whether the choice works on a course directory
    pub fn needs_directory(&self) -> bool {
        matches!(self, MenuChoice::Stage(_) | MenuChoice::FullPipeline | MenuChoice::Status)
    }

    pub fn into_command(self, dir: PathBuf) -> Option<Commands> {
        match self {
            MenuChoice::Stage(stage) => Some(Commands::Stage { stage, dir }),
            MenuChoice::FullPipeline => Some(Commands::Run { dir, until: None }),
            MenuChoice::Status => Some(Commands::Status { dir }),
            MenuChoice::Settings => Some(Commands::Config { show: true }),
            MenuChoice::Quit => None,
        }
    }
}

/// Menu entries in display order; entry `n` is selected by typing `n`
pub fn entries() -> Vec<(MenuChoice, String)> {
    let mut entries: Vec<(MenuChoice, String)> = Stage::ALL
        .iter()
        .map(|s| (MenuChoice::Stage(*s), s.label().to_string()))
        .collect();
    entries.push((MenuChoice::FullPipeline, "Run full pipeline".to_string()));
    entries.push((MenuChoice::Status, "Show status".to_string()));
    entries.push((MenuChoice::Settings, "Settings".to_string()));
    entries
}

pub fn parse_choice(input: &str) -> Option<MenuChoice> {
    let input = input.trim();
    if input.eq_ignore_ascii_case("q") || input == "0" {
        return Some(MenuChoice::Quit);
    }
    let index: usize = input.parse().ok()?;
    entries()
        .into_iter()
        .nth(index.checked_sub(1)?)
        .map(|(choice, _)| choice)
}

/// Show the menu once and read a selection. Returns `None` when the
/// operator quits.
pub fn prompt(term: &Term, last_dir: Option<&PathBuf>) -> Result<Option<Commands>> {
    term.write_line("")?;
    term.write_line(&style("Course Podcaster").bold().to_string())?;
    for (i, (_, label)) in entries().iter().enumerate() {
        term.write_line(&format!("  {:>2}. {}", i + 1, label))?;
    }
    term.write_line("   0. Quit")?;

    let choice = loop {
        term.write_str("> ")?;
        let line = term.read_line()?;
        match parse_choice(&line) {
            Some(choice) => break choice,
            None => term.write_line(&style("Unknown option").red().to_string())?,
        }
    };

    if !choice.needs_directory() {
        return Ok(choice.into_command(PathBuf::new()));
    }

    let hint = last_dir
        .map(|d| format!(" [{}]", d.display()))
        .unwrap_or_default();
    term.write_str(&format!("Course directory{}: ", hint))?;
    let line = term.read_line()?;
    let dir = match (line.trim(), last_dir) {
        ("", Some(last)) => last.clone(),
        ("", None) => {
            term.write_line(&style("A directory is required").red().to_string())?;
            return prompt(term, last_dir);
        }
        (input, _) => PathBuf::from(input),
    };

    Ok(choice.into_command(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_entry_per_stage_plus_actions() {
        let entries = entries();
        assert_eq!(entries.len(), Stage::ALL.len() + 3);
        assert_eq!(entries[0].0, MenuChoice::Stage(Stage::AudioExtracted));
        assert_eq!(entries[8].0, MenuChoice::FullPipeline);
    }

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("2\n"), Some(MenuChoice::Stage(Stage::Transcribed)));
        assert_eq!(parse_choice("10"), Some(MenuChoice::Status));
        assert_eq!(parse_choice("q"), Some(MenuChoice::Quit));
        assert_eq!(parse_choice("0"), Some(MenuChoice::Quit));
        assert_eq!(parse_choice("12"), None);
        assert_eq!(parse_choice("abc"), None);
    }

    #[test]
    fn test_choice_maps_to_command() {
        let command = MenuChoice::FullPipeline.into_command(PathBuf::from("courses"));
        assert!(matches!(command, Some(Commands::Run { until: None, .. })));
        assert!(MenuChoice::Quit.into_command(PathBuf::new()).is_none());
        assert!(!MenuChoice::Settings.needs_directory());
    }
}
