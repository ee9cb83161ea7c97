use legendtrack_core::TopicUpdate;
use legendtrack_workbook::{apply_update, load_snapshot, CellValue, Sheet, Workbook};
use serde_json::json;

fn tracker() -> Workbook {
    let mut topics = Sheet::from_records(
        "Topics",
        &["ID", "Epoch", "Track", "Topic Name", "Status", "Last Worked On"],
        &[
            vec!["E2-B-1", "2", "B", "Concurrency", "", ""],
            vec!["E1-A-3", "1", "A", "Templates", "Stable", ""],
            vec!["E1-A-1", "1", "A", "RAII", "Mastered", ""],
        ],
    );
    topics.set_cell(3, 1, CellValue::Number(1.0));
    topics.set_cell(3, 5, CellValue::date(2024, 1, 15));
    let projects = Sheet::from_records(
        "Projects & Experiments",
        &["Project ID", "Project / Experiment", "Topic IDs Covered"],
        &[vec!["", "Thread pool", "E2-B-1"], vec!["P-1", "Arena", "E1-A-1, E1-A-3"]],
    );
    Workbook::new(vec![topics, projects])
}

#[test]
fn tracker_on_disk_exports_sorted_json_and_accepts_updates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("LegendTrack_Cpp_Tracker.xlsx");
    tracker().save(&path).unwrap();

    let snapshot = load_snapshot(&path).unwrap();
    let ids: Vec<_> = snapshot.topics.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, ["E1-A-1", "E1-A-3", "E2-B-1"]);

    let first = serde_json::to_value(&snapshot.topics[0]).unwrap();
    assert_eq!(first["epoch"], json!(1));
    assert_eq!(first["lastWorkedOn"], "2024-01-15");
    assert_eq!(first["topicName"], "RAII");

    let projects = serde_json::to_value(&snapshot.projects).unwrap();
    assert_eq!(projects[0]["id"], "P-1");
    assert_eq!(projects[1]["id"], "Thread pool");
    assert_eq!(snapshot.projects[0].topic_ids(), ["E1-A-1", "E1-A-3"]);

    let update = TopicUpdate {
        status: Some("In Progress".into()),
        ..TopicUpdate::default()
    };
    let applied = apply_update(&path, "E2-B-1", &update).unwrap();
    assert_eq!(applied.row, 1);

    let after = load_snapshot(&path).unwrap();
    assert_eq!(after.topics[2].status, "In Progress");
    assert_eq!(after.topics[0], snapshot.topics[0]);
    assert_eq!(after.projects, snapshot.projects);
}
