use std::sync::Arc;
use std::time::Duration;

use karte::config::SessionConfig;
use karte::record::{ActiveEditors, EditorId, PresenceEntry, Record, RecordInfo, StoredDocument};
use karte::{
    EditingSession, KarteError, MemoryGrid, MemoryStore, RecordId, RecordStore, SessionHandle,
    StoreError, Timestamp,
};

async fn shared_record(store: &MemoryStore) -> RecordId {
    let id = RecordId::from("shared");
    let record = Record::blank(id.clone());
    store
        .put(&id, record.to_document().expect("encode record"))
        .await
        .expect("create record");
    id
}

fn tab(store: &Arc<MemoryStore>, name: &str) -> SessionHandle {
    let store: Arc<dyn RecordStore> = store.clone();
    EditingSession::spawn(store, MemoryGrid::new(), name, SessionConfig::default())
}

fn names(status: &karte::SessionStatus) -> Vec<String> {
    let mut names: Vec<String> = status.editors.iter().map(|e| e.name.clone()).collect();
    names.sort();
    names
}

#[tokio::test(start_paused = true)]
async fn remote_edit_shows_up_with_recomputed_total() {
    let store = Arc::new(MemoryStore::new("karte"));
    let id = shared_record(&store).await;
    let a = tab(&store, "Aoki");
    let b = tab(&store, "Baba");
    a.open(id.clone()).await.expect("a opens");
    b.open(id.clone()).await.expect("b opens");

    b.set_cell(8, 4, "1000").await.expect("b edits");
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    let seen = a.status().await.expect("a status");
    assert_eq!(seen.grid.get(8, 4), "1000");
    assert_eq!(seen.grid.get(12, 4), "1000");
    assert_eq!(seen.remote_loads, 1);

    // B's own autosave echoed back without reloading B's grid.
    let own = b.status().await.expect("b status");
    assert_eq!(own.remote_loads, 0);
    assert!(!own.unsaved_changes);
}

#[tokio::test(start_paused = true)]
async fn presence_lists_both_tabs_until_one_closes() {
    let store = Arc::new(MemoryStore::new("karte"));
    let id = shared_record(&store).await;
    let a = tab(&store, "Aoki");
    let b = tab(&store, "Baba");
    a.open(id.clone()).await.expect("a opens");
    b.open(id.clone()).await.expect("b opens");

    assert_eq!(names(&a.status().await.expect("status")), vec!["Aoki", "Baba"]);
    assert_eq!(names(&b.status().await.expect("status")), vec!["Aoki", "Baba"]);

    b.close().await.expect("b closes");
    assert_eq!(names(&a.status().await.expect("status")), vec!["Aoki"]);

    let stored = store.get(&id).await.expect("read").into_record();
    assert!(!stored.active_editors.contains_key(b.editor_id()));
    assert!(stored.active_editors.contains_key(a.editor_id()));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_still_withdraws_presence() {
    let store = Arc::new(MemoryStore::new("karte"));
    let id = shared_record(&store).await;
    let a = tab(&store, "Aoki");
    a.open(id.clone()).await.expect("open");
    let editor = a.editor_id().clone();
    drop(a);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let stored = store.get(&id).await.expect("read").into_record();
    assert!(!stored.active_editors.contains_key(&editor));
}

#[tokio::test(start_paused = true)]
async fn unsaved_local_cells_survive_a_remote_update() {
    let store = Arc::new(MemoryStore::new("karte"));
    let id = shared_record(&store).await;
    let a = tab(&store, "Aoki");
    let b = tab(&store, "Baba");
    a.open(id.clone()).await.expect("a opens");
    b.open(id.clone()).await.expect("b opens");

    a.edit("E10", "300").await.expect("a edits");
    b.edit("E9", "1000").await.expect("b edits");
    b.save().await.expect("b saves");

    let seen = a.status().await.expect("status");
    assert_eq!(seen.grid.get(8, 4), "1000");
    assert_eq!(seen.grid.get(9, 4), "300");
    assert!(seen.unsaved_changes);

    // A's autosave writes the merged grid; B picks it up.
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let merged = b.status().await.expect("status");
    assert_eq!(merged.grid.get(8, 4), "1000");
    assert_eq!(merged.grid.get(9, 4), "300");
    assert_eq!(merged.grid.get(12, 4), "1300");
}

#[tokio::test(start_paused = true)]
async fn deleting_the_open_record_falls_back_to_a_new_karte() {
    let store = Arc::new(MemoryStore::new("karte"));
    let id = shared_record(&store).await;
    let a = tab(&store, "Aoki");
    a.open(id.clone()).await.expect("open");
    a.edit("E9", "50").await.expect("edit");

    store.delete(&id).await.expect("delete");
    let status = a.status().await.expect("status");
    assert_eq!(status.record_id, None);
    assert_eq!(status.grid.get(8, 4), "");
    assert!(status.alert.is_some());

    // The cancelled autosave must not resurrect the record.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(matches!(store.get(&id).await, Err(StoreError::NotFound(_))));
}

#[tokio::test(start_paused = true)]
async fn offline_store_is_reported_on_open() {
    let store = Arc::new(MemoryStore::new("karte"));
    let id = shared_record(&store).await;
    let a = tab(&store, "Aoki");

    store.set_online(false);
    let err = a.open(id.clone()).await.expect_err("store is offline");
    assert!(matches!(err, KarteError::Store(StoreError::Unavailable(_))));
    assert!(a.status().await.expect("status").alert.is_some());

    store.set_online(true);
    a.dismiss_alert().await.expect("dismiss");
    a.open(id).await.expect("open once online");
    assert_eq!(a.status().await.expect("status").alert, None);
}

#[tokio::test(start_paused = true)]
async fn inserted_rows_are_saved_and_totalled() {
    let store = Arc::new(MemoryStore::new("karte"));
    let id = shared_record(&store).await;
    let a = tab(&store, "Aoki");
    a.open(id.clone()).await.expect("open");

    a.insert_row(9).await.expect("insert");
    a.set_cell(9, 4, "400").await.expect("edit");
    a.set_cell(8, 4, "100").await.expect("edit");
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    let stored = store.get(&id).await.expect("read").into_record();
    assert_eq!(stored.grid.get(13, 0), "A；入金合計");
    assert_eq!(stored.grid.get(13, 4), "500");
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_tabs_listed_and_silent_tabs_expire() {
    let store = Arc::new(MemoryStore::new("karte"));
    let id = shared_record(&store).await;
    let a = tab(&store, "Aoki");
    let b = tab(&store, "Baba");
    a.open(id.clone()).await.expect("a opens");
    b.open(id.clone()).await.expect("b opens");
    tokio::time::sleep(Duration::from_secs(2)).await;

    // A's last heartbeat is six minutes old and a crashed tab never left.
    let six_minutes_ago = Timestamp::from_millis(Timestamp::now().millis() - 360_000);
    let mut record = store.get(&id).await.expect("read").into_record();
    let stale = PresenceEntry {
        name: "Aoki".to_string(),
        last_active: six_minutes_ago,
    };
    record.active_editors.insert(a.editor_id().clone(), stale);
    record.active_editors.insert(
        EditorId::from("crashed-tab"),
        PresenceEntry {
            name: "Chiba".to_string(),
            last_active: six_minutes_ago,
        },
    );
    record.origin = None;
    store
        .put(&id, record.to_document().expect("encode"))
        .await
        .expect("write stale presence");
    assert_eq!(names(&b.status().await.expect("status")), vec!["Baba"]);

    // One heartbeat period later A has refreshed itself and the crashed tab is pruned.
    tokio::time::sleep(Duration::from_secs(61)).await;
    let stored = store.get(&id).await.expect("read").into_record();
    let refreshed = &stored.active_editors[a.editor_id()];
    assert!(refreshed.last_active > six_minutes_ago);
    assert!(!stored.active_editors.contains_key(&EditorId::from("crashed-tab")));
    assert_eq!(names(&b.status().await.expect("status")), vec!["Aoki", "Baba"]);

    // Both tabs stay listed well past the TTL while they keep heartbeating.
    let before = store.get(&id).await.expect("read").last_updated;
    tokio::time::sleep(Duration::from_secs(6 * 60)).await;
    let after = store.get(&id).await.expect("read");
    assert!(after.last_updated > before);
    assert_eq!(names(&a.status().await.expect("status")), vec!["Aoki", "Baba"]);
    assert_eq!(names(&b.status().await.expect("status")), vec!["Aoki", "Baba"]);
}

#[tokio::test(start_paused = true)]
async fn opening_an_unreadable_record_leaves_it_stored_as_is() {
    let store = Arc::new(MemoryStore::new("karte"));
    let id = RecordId::from("future");
    let grid_serialized = r#"{"future":"schema"}"#.to_string();
    store
        .put(
            &id,
            StoredDocument::Current {
                derived_info: RecordInfo::default(),
                grid_serialized: grid_serialized.clone(),
                active_editors: ActiveEditors::new(),
                origin: None,
            },
        )
        .await
        .expect("store record");

    let a = tab(&store, "Aoki");
    a.open(id.clone()).await.expect("open falls back to the template");
    let status = a.status().await.expect("status");
    assert_eq!(status.grid.get(0, 0), "◆ 基本情報");
    tokio::time::sleep(Duration::from_secs(61)).await;
    a.close().await.expect("close");

    match store.get(&id).await.expect("read").document {
        StoredDocument::Current {
            grid_serialized: stored,
            active_editors,
            ..
        } => {
            assert_eq!(stored, grid_serialized);
            assert!(active_editors.is_empty());
        }
        other => panic!("unexpected document {other:?}"),
    }
}
