use super::{AiLogEntry, AiLogStore, SledAiLog};
use tempfile::tempdir;

#[tokio::test]
async fn test_record_and_load_per_mentee() {
    let dir = tempdir().unwrap();
    let log = SledAiLog::open(dir.path().to_str().unwrap()).unwrap();
    assert!(log.is_empty());

    log.record(&AiLogEntry::new(42, "Hi", "Hello!")).await.unwrap();
    log.record(&AiLogEntry::new(42, "How?", "Like this.")).await.unwrap();
    log.record(&AiLogEntry::new(7, "Other", "Answer")).await.unwrap();

    let entries = log.entries_for(42).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].prompt, "Hi");
    assert_eq!(entries[0].response, "Hello!");
    assert_eq!(entries[1].prompt, "How?");
    assert!(entries.iter().all(|e| e.mentee_id == 42));

    assert_eq!(log.entries_for(7).unwrap().len(), 1);
    assert!(log.entries_for(1).unwrap().is_empty());
    assert_eq!(log.len(), 3);
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    {
        let log = SledAiLog::open(&path).unwrap();
        log.record(&AiLogEntry::new(42, "Hi", "Hello!")).await.unwrap();
        log.flush().unwrap();
    }

    let log = SledAiLog::open(&path).unwrap();
    let entries = log.entries_for(42).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].response, "Hello!");
}

#[test]
fn test_entry_wire_names() {
    let entry = AiLogEntry::new(42, "Hi", "Hello!");
    let value = serde_json::to_value(&entry).unwrap();
    assert_eq!(value["menteeId"], 42);
    assert_eq!(value["prompt"], "Hi");
    assert_eq!(value["response"], "Hello!");
}
