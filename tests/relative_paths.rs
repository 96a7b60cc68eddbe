mod common;

use tempfile::TempDir;

use common::{coordinator, test_config, Calls, Failures};
use course_podcaster::batch::discover;
use course_podcaster::ItemOutcome;

// Changes the process working directory, so it lives alone in this binary.
#[tokio::test]
async fn test_resume_from_another_working_directory() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    let lesson_dir = work.join("courses").join("rust");
    fs_err::create_dir_all(&lesson_dir).unwrap();
    fs_err::write(lesson_dir.join("01-intro.mp4"), b"video").unwrap();

    let config = test_config();
    let calls = Calls::default();
    let original_cwd = std::env::current_dir().unwrap();

    std::env::set_current_dir(&work).unwrap();
    let first = discover(
        "courses".as_ref(),
        &config.discovery,
        &config.pipeline.workspace_dir,
    )
    .unwrap();
    assert!(first.root.is_absolute());
    assert!(first.items.iter().all(|item| item.is_absolute()));

    let report = coordinator(&config, &calls, &Failures::default())
        .run_batch(&first.items, None)
        .await
        .unwrap();
    assert_eq!(report.counts().completed, 1);
    let after_first = calls.count();

    std::env::set_current_dir(dir.path()).unwrap();
    let second = discover(
        "work/courses".as_ref(),
        &config.discovery,
        &config.pipeline.workspace_dir,
    )
    .unwrap();
    let again = coordinator(&config, &calls, &Failures::default())
        .run_batch(&second.items, None)
        .await
        .unwrap();

    std::env::set_current_dir(original_cwd).unwrap();

    assert_eq!(second.items, first.items);
    assert_eq!(again.outcome_for(&second.items[0]), Some(&ItemOutcome::Completed));
    assert!(again.items[0].stages_run.is_empty());
    assert_eq!(calls.count(), after_first);
}
