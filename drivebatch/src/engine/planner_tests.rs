use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::engine::memory_store::{Call, MemoryStore};

fn planner(store: &Arc<MemoryStore>) -> Planner {
    let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 2);
    Planner::new(store.clone(), policy, 50)
}

fn copy(source: &str, destination: &str) -> Command {
    Command::Copy {
        source: source.to_string(),
        destination: Some(destination.to_string()),
        new_name: None,
    }
}

fn existing(id: &str) -> FolderRef {
    FolderRef::Existing(id.to_string())
}

fn operations(plan: &Plan) -> Vec<Operation> {
    plan.operations.iter().map(|op| op.operation.clone()).collect()
}

fn scenario_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.add_root("root");
    store.add_folder("root", "R", "R");
    store.add_folder("R", "D1", "D1");
    store.add_file("R", "f", "f.txt", 100, None);
    store.add_folder("root", "R2", "R2");
    Arc::new(store)
}

#[tokio::test]
async fn copy_plans_folder_before_file() {
    let store = scenario_store();
    let plan = planner(&store).plan(&copy("R", "R2")).await.unwrap();

    assert_eq!(
        operations(&plan),
        vec![
            Operation::CreateFolder {
                name: "D1".into(),
                parent: existing("R2"),
            },
            Operation::CopyItem {
                source_id: "f".into(),
                dest_parent: existing("R2"),
                new_name: None,
            },
        ]
    );
    assert!(store.mutation_calls().is_empty());
}

#[tokio::test]
async fn copy_skips_file_already_in_destination() {
    let store = scenario_store();
    store.add_file("R2", "f-old", "f.txt", 100, None);
    let plan = planner(&store).plan(&copy("R", "R2")).await.unwrap();

    assert_eq!(
        operations(&plan),
        vec![Operation::CreateFolder {
            name: "D1".into(),
            parent: existing("R2"),
        }]
    );
    assert_eq!(plan.skipped.len(), 1);
    assert_eq!(plan.skipped[0].existing_id, "f-old");
}

#[tokio::test]
async fn nested_folders_reference_planned_parents() {
    let store = scenario_store();
    store.add_folder("D1", "D2", "D2");
    store.add_file("D2", "g", "g.txt", 5, Some("aa"));
    let plan = planner(&store).plan(&copy("R", "R2")).await.unwrap();

    assert!(plan.check_ordering().is_ok());
    assert_eq!(
        operations(&plan)[..3],
        [
            Operation::CreateFolder {
                name: "D1".into(),
                parent: existing("R2"),
            },
            Operation::CreateFolder {
                name: "D2".into(),
                parent: FolderRef::Planned(0),
            },
            Operation::CopyItem {
                source_id: "g".into(),
                dest_parent: FolderRef::Planned(1),
                new_name: None,
            },
        ]
    );
    assert_eq!(plan.operations[2].path, "D1/D2/g.txt");
}

#[tokio::test]
async fn existing_destination_folder_is_merged() {
    let store = scenario_store();
    store.add_file("D1", "h", "h.txt", 7, None);
    store.add_folder("R2", "D1-copy", "D1");
    store.add_file("D1-copy", "h-copy", "h.txt", 7, None);
    let plan = planner(&store).plan(&copy("R", "R2")).await.unwrap();

    assert_eq!(
        operations(&plan),
        vec![Operation::CopyItem {
            source_id: "f".into(),
            dest_parent: existing("R2"),
            new_name: None,
        }]
    );
    let reasons: Vec<_> = plan.skipped.iter().map(|s| s.existing_id.as_str()).collect();
    assert_eq!(reasons, vec!["D1-copy", "h-copy"]);
}

#[tokio::test]
async fn unlistable_merge_target_drops_only_its_branch() {
    let store = scenario_store();
    store.add_file("D1", "h", "h.txt", 7, None);
    store.add_folder("R2", "D1x", "D1");
    store.fail(Call::List, "D1x", [StoreError::Permanent("denied".into())]);
    let plan = planner(&store).plan(&copy("R", "R2")).await.unwrap();

    assert_eq!(
        operations(&plan),
        vec![Operation::CopyItem {
            source_id: "f".into(),
            dest_parent: existing("R2"),
            new_name: None,
        }]
    );
    assert_eq!(plan.unreachable.len(), 1);
    assert_eq!(plan.unreachable[0].folder_id, "D1x");
    assert_eq!(plan.unreachable[0].path, "D1");
    assert!(!store.calls().contains(&"list:D1".to_string()));
}

#[tokio::test]
async fn unlistable_existing_wrapper_plans_nothing() {
    let store = scenario_store();
    store.add_folder("R2", "W", "Backup");
    store.fail(Call::List, "W", [StoreError::Permanent("denied".into())]);
    let command = Command::Copy {
        source: "R".into(),
        destination: Some("R2".into()),
        new_name: Some("Backup".into()),
    };
    let plan = planner(&store).plan(&command).await.unwrap();

    assert!(plan.is_empty());
    assert_eq!(plan.unreachable.len(), 1);
    assert_eq!(plan.unreachable[0].folder_id, "W");
}

#[tokio::test]
async fn folder_copy_with_new_name_creates_wrapper_first() {
    let store = scenario_store();
    let command = Command::Copy {
        source: "https://drive.google.com/drive/folders/R".into(),
        destination: Some("R2".into()),
        new_name: Some("Backup".into()),
    };
    let plan = planner(&store).plan(&command).await.unwrap();

    assert_eq!(
        operations(&plan)[0],
        Operation::CreateFolder {
            name: "Backup".into(),
            parent: existing("R2"),
        }
    );
    assert!(
        plan.operations[1..]
            .iter()
            .all(|op| op.operation.parent() == Some(&FolderRef::Planned(0)))
    );
}

#[tokio::test]
async fn file_copy_defaults_to_root_and_applies_new_name() {
    let store = scenario_store();
    let command = Command::Copy {
        source: "https://drive.google.com/file/d/f/view?usp=sharing".into(),
        destination: None,
        new_name: Some("renamed.txt".into()),
    };
    let plan = planner(&store).plan(&command).await.unwrap();

    assert_eq!(
        operations(&plan),
        vec![Operation::CopyItem {
            source_id: "f".into(),
            dest_parent: existing("root"),
            new_name: Some("renamed.txt".into()),
        }]
    );
}

#[tokio::test]
async fn planning_twice_gives_identical_plans() {
    let store = scenario_store();
    store.add_folder("D1", "D2", "D2");
    store.add_file("D2", "g", "g.txt", 5, None);
    let planner = planner(&store);

    let first = planner.plan(&copy("R", "R2")).await.unwrap();
    let second = planner.plan(&copy("R", "R2")).await.unwrap();
    assert_eq!(first, second);
    assert!(store.mutation_calls().is_empty());
}

#[tokio::test]
async fn unreachable_source_branch_is_recorded() {
    let store = scenario_store();
    store.fail(Call::List, "D1", [StoreError::Permanent("forbidden".into())]);
    let plan = planner(&store).plan(&copy("R", "R2")).await.unwrap();

    assert_eq!(plan.len(), 2);
    assert_eq!(plan.unreachable.len(), 1);
    assert_eq!(plan.unreachable[0].folder_id, "D1");
}

#[tokio::test]
async fn missing_source_is_a_lookup_error() {
    let store = scenario_store();
    let err = planner(&store).plan(&copy("nope", "R2")).await.unwrap_err();
    assert!(matches!(
        err,
        PlanningError::Lookup {
            what: "source",
            source: StoreError::NotFound(_),
            ..
        }
    ));
}

fn rename(folder: &str, target: &str, prefix: Option<&str>, suffix: Option<&str>) -> Command {
    Command::Modify {
        folder_id: folder.into(),
        target: target.into(),
        prefix: prefix.map(str::to_string),
        suffix: suffix.map(str::to_string),
        keep_extension: false,
    }
}

#[tokio::test]
async fn rename_uses_original_names_only() {
    let store = MemoryStore::new();
    store.add_root("F");
    store.add_file("F", "a", "A", 1, None);
    store.add_file("F", "pa", "prefix_A", 1, None);
    let store = Arc::new(store);

    let plan = planner(&store)
        .plan(&rename("F", "*", Some("prefix_"), None))
        .await
        .unwrap();

    assert_eq!(
        operations(&plan),
        vec![
            Operation::RenameItem {
                item_id: "a".into(),
                new_name: "prefix_A".into(),
            },
            Operation::RenameItem {
                item_id: "pa".into(),
                new_name: "prefix_prefix_A".into(),
            },
        ]
    );
}

#[tokio::test]
async fn rename_matches_folders_and_descends_into_them() {
    let store = MemoryStore::new();
    store.add_root("F");
    store.add_folder("F", "docs", "Docs");
    store.add_file("docs", "r", "report.DOCX", 1, None);
    store.add_file("F", "n", "notes.txt", 1, None);
    let store = Arc::new(store);

    let plan = planner(&store)
        .plan(&rename("F", "*.docx", None, Some("_old")))
        .await
        .unwrap();
    assert_eq!(
        operations(&plan),
        vec![Operation::RenameItem {
            item_id: "r".into(),
            new_name: "report.DOCX_old".into(),
        }]
    );
    assert_eq!(plan.operations[0].path, "Docs/report.DOCX");
}

#[tokio::test]
async fn keep_extension_places_suffix_before_extension() {
    let store = MemoryStore::new();
    store.add_root("F");
    store.add_file("F", "r", "report.final.docx", 1, None);
    store.add_file("F", "h", ".hidden", 1, None);
    store.add_folder("F", "d", "v1.0");
    let store = Arc::new(store);

    let command = Command::Modify {
        folder_id: "F".into(),
        target: "*".into(),
        prefix: None,
        suffix: Some("_v2".into()),
        keep_extension: true,
    };
    let plan = planner(&store).plan(&command).await.unwrap();
    let names: Vec<_> = operations(&plan)
        .into_iter()
        .map(|op| match op {
            Operation::RenameItem { new_name, .. } => new_name,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(names, vec!["report.final_v2.docx", ".hidden_v2", "v1.0_v2"]);
}

#[tokio::test]
async fn rename_needs_prefix_or_suffix_and_valid_pattern() {
    let store = scenario_store();
    let planner = planner(&store);

    assert!(matches!(
        planner.plan(&rename("R", "*", Some(""), None)).await,
        Err(PlanningError::MissingArgument(_))
    ));
    assert!(matches!(
        planner.plan(&rename("R", "abc\\", Some("x"), None)).await,
        Err(PlanningError::Pattern(_))
    ));
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn delete_prunes_matched_folders() {
    let store = MemoryStore::new();
    store.add_root("F");
    store.add_folder("F", "old-dir", "old");
    store.add_file("old-dir", "inner", "old.txt", 1, None);
    store.add_file("F", "top", "old.txt", 1, None);
    store.add_file("F", "keep", "new.txt", 1, None);
    let store = Arc::new(store);

    let command = Command::Delete {
        folder_id: "F".into(),
        pattern: "old*".into(),
    };
    let plan = planner(&store).plan(&command).await.unwrap();

    assert_eq!(
        operations(&plan),
        vec![
            Operation::DeleteItem {
                item_id: "old-dir".into(),
            },
            Operation::DeleteItem {
                item_id: "top".into(),
            },
        ]
    );
    assert!(!store.calls().contains(&"list:old-dir".to_string()));
}

#[tokio::test]
async fn delete_of_unlistable_root_fails_planning() {
    let store = MemoryStore::new();
    let store = Arc::new(store);
    let command = Command::Delete {
        folder_id: "missing".into(),
        pattern: "*".into(),
    };
    let err = planner(&store).plan(&command).await.unwrap_err();
    assert!(matches!(err, PlanningError::Lookup { what: "folder", .. }));
}

fn fan_out_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.add_root("P");
    store.add_root("src-dir");
    store.add_file("src-dir", "src", "template.docx", 42, Some("abc"));
    store.add_folder("P", "s1", "Alice");
    store.add_folder("P", "s2", "Bob");
    store.add_folder("s1", "deep", "Nested");
    store.add_file("s2", "s2-copy", "template.docx", 42, Some("abc"));
    store.add_file("P", "loose", "readme.txt", 1, None);
    Arc::new(store)
}

#[tokio::test]
async fn copy_to_subfolders_targets_direct_children_only() {
    let store = fan_out_store();
    let command = Command::CopyToSubfolders {
        source_id: "src".into(),
        folder_id: "P".into(),
    };
    let plan = planner(&store).plan(&command).await.unwrap();

    assert_eq!(
        operations(&plan),
        vec![Operation::CopyItem {
            source_id: "src".into(),
            dest_parent: existing("s1"),
            new_name: None,
        }]
    );
    assert_eq!(plan.skipped.len(), 1);
    assert_eq!(plan.skipped[0].path, "Bob/template.docx");
    assert!(!store.calls().contains(&"list:deep".to_string()));
}

#[tokio::test]
async fn copy_to_subfolders_requires_a_file_source() {
    let store = fan_out_store();
    let command = Command::CopyToSubfolders {
        source_id: "s1".into(),
        folder_id: "P".into(),
    };
    let err = planner(&store).plan(&command).await.unwrap_err();
    assert!(matches!(err, PlanningError::NotAFile(id) if id == "s1"));
}

#[tokio::test]
async fn copy_to_subfolders_skips_unlistable_subfolder() {
    let store = fan_out_store();
    store.fail(Call::List, "s1", [StoreError::Permanent("denied".into())]);
    let command = Command::CopyToSubfolders {
        source_id: "src".into(),
        folder_id: "P".into(),
    };
    let plan = planner(&store).plan(&command).await.unwrap();

    assert!(plan.is_empty());
    assert_eq!(plan.unreachable.len(), 1);
    assert_eq!(plan.unreachable[0].folder_id, "s1");
}

#[tokio::test]
async fn batch_keeps_planning_after_a_failed_entry() {
    let store = scenario_store();
    store.add_folder("R2", "D9", "D9");
    let entries = vec![
        BatchEntry {
            description: Some("broken".into()),
            command: Err("invalid batch entry: unknown variant `explode`".into()),
        },
        BatchEntry::new(copy("R", "R2")),
        BatchEntry::new(Command::Batch(Vec::new())),
        BatchEntry::new(Command::Delete {
            folder_id: "R2".into(),
            pattern: "D9".into(),
        }),
    ];
    let plan = planner(&store).plan(&Command::Batch(entries)).await.unwrap();

    assert_eq!(plan.len(), 3);
    assert!(matches!(
        plan.operations[2].operation,
        Operation::DeleteItem { ref item_id } if item_id == "D9"
    ));
    let failed: Vec<_> = plan.failures.iter().map(|f| f.entry).collect();
    assert_eq!(failed, vec![1, 3]);
    assert_eq!(plan.failures[0].description.as_deref(), Some("broken"));
    assert!(plan.check_ordering().is_ok());
}

#[tokio::test]
async fn batch_rebases_planned_parents() {
    let store = scenario_store();
    store.add_folder("D1", "D2", "D2");
    let entries = vec![
        BatchEntry::new(copy("R", "R2")),
        BatchEntry::new(copy("R", "root")),
    ];
    let plan = planner(&store).plan(&Command::Batch(entries)).await.unwrap();

    assert_eq!(plan.len(), 6);
    assert_eq!(
        plan.operations[4].operation.parent(),
        Some(&FolderRef::Planned(3))
    );
    assert!(plan.check_ordering().is_ok());
}
