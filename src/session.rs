//! Editing session: the per-tab context that owns the open record.
//!
//! An [`EditingSession`] is a spawned task holding the grid widget, the open
//! record's subscription and every timer that belongs to it. Callers talk to
//! it through a cloneable [`SessionHandle`]; commands and store events are
//! processed one at a time, so nothing inside the session needs a lock.
//!
//! Closing a record (explicitly, by opening another one, by dropping every
//! handle or by shutting the session down) always runs the same teardown:
//! stop the heartbeat, withdraw presence, unsubscribe. Pending autosaves and
//! recalculations of the closed record are cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};

use crate::codec;
use crate::config::SessionConfig;
use crate::echo::{Delivery, EchoSuppressor};
use crate::error::KarteError;
use crate::grid::{ChangeSource, Grid, GridWidget, parse_cell_name};
use crate::presence::{self, ActiveEditor, PresenceTracker};
use crate::record::{ActiveEditors, EditorId, Record, RecordId, RecordInfo, Timestamp};
use crate::store::{RecordStore, StoreEvent, Subscription};
use crate::template::{self, merged_regions};
use crate::totals::Recalculator;

const COMMAND_BUFFER: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, KarteError>>;

enum Command {
    Open { id: RecordId, reply: Reply<()> },
    Close { reply: Reply<()> },
    NewRecord { reply: Reply<()> },
    SetCell {
        row: usize,
        col: usize,
        value: String,
        reply: Reply<()>,
    },
    InsertRow { at: usize, reply: Reply<()> },
    RemoveRow { at: usize, reply: Reply<()> },
    Save { reply: Reply<RecordId> },
    Import { bytes: Vec<u8>, reply: Reply<()> },
    Export { reply: Reply<Vec<u8>> },
    Status { reply: Reply<SessionStatus> },
    DismissAlert { reply: Reply<()> },
    Shutdown { reply: Reply<()> },
}

/// What the tab currently shows.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub editor_id: EditorId,
    pub editor_name: String,
    /// `None` while editing a record that has never been saved.
    pub record_id: Option<RecordId>,
    pub grid: Grid,
    /// Live presence entries of the open record, this editor included.
    pub editors: Vec<ActiveEditor>,
    pub unsaved_changes: bool,
    pub last_saved: Option<Timestamp>,
    /// Dismissable error message from the last failed operation.
    pub alert: Option<String>,
    /// How many times a remote version replaced the grid.
    pub remote_loads: usize,
}

/// Cloneable address of a running [`EditingSession`].
#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    editor: EditorId,
    name: String,
}

impl SessionHandle {
    pub fn editor_id(&self) -> &EditorId {
        &self.editor
    }

    pub fn editor_name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, KarteError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| KarteError::SessionClosed)?;
        response.await.map_err(|_| KarteError::SessionClosed)?
    }

    /// Close whatever is open and open `id`.
    pub async fn open(&self, id: RecordId) -> Result<(), KarteError> {
        self.request(|reply| Command::Open { id, reply }).await
    }

    /// Close the open record, keeping its grid on screen as an unsaved copy.
    pub async fn close(&self) -> Result<(), KarteError> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Close the open record and start a blank, unsaved karte.
    pub async fn new_record(&self) -> Result<(), KarteError> {
        self.request(|reply| Command::NewRecord { reply }).await
    }

    pub async fn set_cell(
        &self,
        row: usize,
        col: usize,
        value: impl Into<String>,
    ) -> Result<(), KarteError> {
        let value = value.into();
        self.request(|reply| Command::SetCell {
            row,
            col,
            value,
            reply,
        })
        .await
    }

    /// Edit a cell by its A1 name.
    pub async fn edit(&self, cell: &str, value: impl Into<String>) -> Result<(), KarteError> {
        let (row, col) =
            parse_cell_name(cell).ok_or_else(|| KarteError::InvalidCell(cell.to_string()))?;
        self.set_cell(row, col, value).await
    }

    pub async fn insert_row(&self, at: usize) -> Result<(), KarteError> {
        self.request(|reply| Command::InsertRow { at, reply }).await
    }

    pub async fn remove_row(&self, at: usize) -> Result<(), KarteError> {
        self.request(|reply| Command::RemoveRow { at, reply }).await
    }

    /// Save now. A karte that was never saved gets a new id.
    pub async fn save(&self) -> Result<RecordId, KarteError> {
        self.request(|reply| Command::Save { reply }).await
    }

    pub async fn import(&self, bytes: Vec<u8>) -> Result<(), KarteError> {
        self.request(|reply| Command::Import { bytes, reply }).await
    }

    pub async fn export(&self) -> Result<Vec<u8>, KarteError> {
        self.request(|reply| Command::Export { reply }).await
    }

    pub async fn status(&self) -> Result<SessionStatus, KarteError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn grid(&self) -> Result<Grid, KarteError> {
        Ok(self.status().await?.grid)
    }

    pub async fn dismiss_alert(&self) -> Result<(), KarteError> {
        self.request(|reply| Command::DismissAlert { reply }).await
    }

    /// Close the open record and stop the session task.
    pub async fn shutdown(&self) -> Result<(), KarteError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Everything that lives exactly as long as one record is open.
struct OpenRecord {
    id: RecordId,
    subscription: Option<Subscription>,
    heartbeat: Interval,
    autosave_at: Option<Instant>,
    echo: EchoSuppressor,
    /// Cells edited locally since the last save.
    dirty: BTreeMap<(usize, usize), String>,
    /// Rows were inserted or removed (or the grid replaced) since the last save.
    restructured: bool,
    editors: ActiveEditors,
}

impl OpenRecord {
    fn new(id: RecordId, subscription: Subscription, config: &SessionConfig, editor: EditorId) -> Self {
        let period = config.heartbeat();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        OpenRecord {
            id,
            subscription: Some(subscription),
            heartbeat,
            autosave_at: None,
            echo: EchoSuppressor::new(editor, config.suppression_window()),
            dirty: BTreeMap::new(),
            restructured: false,
            editors: ActiveEditors::new(),
        }
    }

    fn has_unsaved_changes(&self) -> bool {
        self.restructured || !self.dirty.is_empty()
    }
}

pub struct EditingSession<W> {
    store: Arc<dyn RecordStore>,
    widget: W,
    config: SessionConfig,
    presence: PresenceTracker,
    recalc: Recalculator,
    recalc_at: Option<Instant>,
    open: Option<OpenRecord>,
    last_saved: Option<Timestamp>,
    alert: Option<String>,
    remote_loads: usize,
}

impl<W: GridWidget> EditingSession<W> {
    /// Start a session showing a blank karte.
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        widget: W,
        editor_name: impl Into<String>,
        config: SessionConfig,
    ) -> SessionHandle {
        let editor = EditorId::generate();
        let name = editor_name.into();
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

        let session = EditingSession {
            store,
            widget,
            presence: PresenceTracker::new(editor.clone(), name.clone(), config.presence_ttl()),
            config,
            recalc: Recalculator::new(),
            recalc_at: None,
            open: None,
            last_saved: None,
            alert: None,
            remote_loads: 0,
        };
        tokio::spawn(session.run(rx));

        SessionHandle { tx, editor, name }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("editing session {} ({}) started", self.presence.editor(), self.presence.name());
        self.show(template::blank_karte());

        let mut shutdown = None;
        loop {
            let autosave_at = self.open.as_ref().and_then(|open| open.autosave_at);
            let window_at = self.open.as_ref().and_then(|open| open.echo.window_deadline());
            let recalc_at = self.recalc_at;
            let (subscription, heartbeat) = match self.open.as_mut() {
                Some(open) => (open.subscription.as_mut(), Some(&mut open.heartbeat)),
                None => (None, None),
            };

            tokio::select! {
                biased;

                event = next_event(subscription) => self.on_store_event(event).await,
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        shutdown = Some(reply);
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = wait_until(recalc_at) => self.recalculate(),
                _ = wait_until(autosave_at) => self.autosave().await,
                _ = wait_until(window_at) => self.close_window().await,
                _ = next_tick(heartbeat) => self.heartbeat().await,
            }
        }

        self.teardown(true).await;
        info!("editing session {} stopped", self.presence.editor());
        if let Some(reply) = shutdown {
            let _ = reply.send(Ok(()));
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Open { id, reply } => {
                let result = self.open_record(id).await;
                let _ = reply.send(self.report(result));
            }
            Command::Close { reply } => {
                self.teardown(true).await;
                let _ = reply.send(Ok(()));
            }
            Command::NewRecord { reply } => {
                self.teardown(true).await;
                self.last_saved = None;
                self.show(template::blank_karte());
                let _ = reply.send(Ok(()));
            }
            Command::SetCell {
                row,
                col,
                value,
                reply,
            } => {
                let result = self
                    .widget
                    .set_cell(row, col, &value, ChangeSource::Edit)
                    .map_err(KarteError::from);
                self.drain_changes();
                let _ = reply.send(self.report(result));
            }
            Command::InsertRow { at, reply } => {
                let result = self.widget.insert_row(at).map_err(KarteError::from);
                self.drain_changes();
                let _ = reply.send(self.report(result));
            }
            Command::RemoveRow { at, reply } => {
                let result = self.widget.remove_row(at).map_err(KarteError::from);
                self.drain_changes();
                let _ = reply.send(self.report(result));
            }
            Command::Save { reply } => {
                let result = self.save().await;
                let _ = reply.send(self.report(result));
            }
            Command::Import { bytes, reply } => {
                let result = self.import(&bytes);
                let _ = reply.send(self.report(result));
            }
            Command::Export { reply } => {
                let result = self.export();
                let _ = reply.send(self.report(result));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            Command::DismissAlert { reply } => {
                self.alert = None;
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Record a failed user operation as the session alert.
    fn report<T>(&mut self, result: Result<T, KarteError>) -> Result<T, KarteError> {
        match &result {
            Err(KarteError::Render(err)) => warn!("grid operation skipped: {err}"),
            Err(err) => {
                error!("{err}");
                self.alert = Some(err.to_string());
            }
            Ok(_) => {}
        }
        result
    }

    async fn open_record(&mut self, id: RecordId) -> Result<(), KarteError> {
        self.teardown(true).await;

        // Subscribe before reading so no write between the two is missed.
        let subscription = self.store.subscribe(&id)?;
        let snapshot = self.store.get(&id).await?;

        let mut open = OpenRecord::new(
            id.clone(),
            subscription,
            &self.config,
            self.presence.editor().clone(),
        );
        open.echo.loaded(snapshot.last_updated);
        let record = snapshot.into_record();
        open.editors = record.active_editors;
        self.open = Some(open);
        self.last_saved = Some(record.last_updated);
        self.show(record.grid);
        info!("opened karte {id}");

        self.announce().await;
        Ok(())
    }

    /// Load a whole grid into the widget.
    fn show(&mut self, grid: Grid) {
        let grid = grid.padded(self.config.min_rows, self.config.min_cols);
        if let Err(err) = self.widget.load_grid(grid) {
            warn!("could not load grid into the widget: {err}");
        }
        self.drain_changes();
    }

    /// React to the widget's change notifications.
    fn drain_changes(&mut self) {
        let batches = self.widget.take_changes();
        if batches.is_empty() {
            return;
        }
        let now = Instant::now();

        if batches.iter().any(|batch| batch.source.triggers_recalc()) {
            self.recalc_at = Some(now + self.config.recalc_debounce());
        }
        if !batches.iter().any(|batch| batch.source.is_user_edit()) {
            return;
        }

        let grid = self.widget.read_grid().ok();
        let Some(open) = self.open.as_mut() else {
            return;
        };
        for batch in batches.iter().filter(|batch| batch.source.is_user_edit()) {
            match batch.source {
                ChangeSource::RowInsert | ChangeSource::RowRemove => open.restructured = true,
                _ => {
                    for &(row, col) in &batch.cells {
                        let value = grid.as_ref().map_or("", |g| g.get(row, col));
                        open.dirty.insert((row, col), value.to_string());
                    }
                }
            }
        }
        open.autosave_at = Some(now + self.config.autosave_debounce());
    }

    fn recalculate(&mut self) {
        self.recalc_at = None;
        match self.recalc.run(&mut self.widget) {
            Ok(0) => {}
            Ok(changed) => debug!("recalculated {changed} derived cells"),
            Err(err) => warn!("recalculation skipped: {err}"),
        }
        self.drain_changes();
    }

    async fn autosave(&mut self) {
        match self.open.as_mut() {
            Some(open) => open.autosave_at = None,
            None => return,
        }
        if let Err(err) = self.save().await {
            error!("autosave failed: {err}");
            self.alert = Some(err.to_string());
        }
    }

    async fn save(&mut self) -> Result<RecordId, KarteError> {
        if self.recalc_at.is_some() {
            self.recalculate();
        }
        let grid = self.widget.read_grid()?;
        let now = Timestamp::now();
        let editor = self.presence.editor().clone();

        let Some(open) = self.open.as_mut() else {
            return self.create(grid).await;
        };

        let mut editors = open.editors.clone();
        presence::prune(&mut editors, now, self.presence.ttl());
        presence::join(&mut editors, &editor, self.presence.name(), now);
        let record = Record {
            id: open.id.clone(),
            info: RecordInfo::extract(&grid),
            grid,
            last_updated: now,
            active_editors: editors,
            origin: Some(editor),
        };
        let document = record.to_document()?;

        open.echo.begin_write();
        match self.store.put(&open.id, document).await {
            Ok(committed) => {
                open.echo.finish_write(committed, Instant::now());
                open.dirty.clear();
                open.restructured = false;
                open.autosave_at = None;
                open.editors = record.active_editors;
                self.last_saved = Some(committed);
                info!("saved karte {} at {}", open.id, committed.to_local_string());
                Ok(open.id.clone())
            }
            Err(err) => {
                open.echo.abort_write(Instant::now());
                Err(err.into())
            }
        }
    }

    /// First save of a karte that has no id yet.
    async fn create(&mut self, grid: Grid) -> Result<RecordId, KarteError> {
        let id = RecordId::generate();
        let now = Timestamp::now();
        let editor = self.presence.editor().clone();

        let mut editors = ActiveEditors::new();
        presence::join(&mut editors, &editor, self.presence.name(), now);
        let record = Record {
            id: id.clone(),
            info: RecordInfo::extract(&grid),
            grid,
            last_updated: now,
            active_editors: editors,
            origin: Some(editor.clone()),
        };

        let subscription = self.store.subscribe(&id)?;
        let committed = self.store.put(&id, record.to_document()?).await?;

        let mut open = OpenRecord::new(id.clone(), subscription, &self.config, editor);
        open.echo.loaded(committed);
        open.editors = record.active_editors;
        self.open = Some(open);
        self.last_saved = Some(committed);
        info!("created karte {id}");
        Ok(id)
    }

    fn import(&mut self, bytes: &[u8]) -> Result<(), KarteError> {
        match codec::parse_workbook(bytes) {
            Ok(grid) => {
                self.show(grid);
                if let Some(open) = self.open.as_mut() {
                    open.restructured = true;
                    open.autosave_at = Some(Instant::now() + self.config.autosave_debounce());
                }
                Ok(())
            }
            Err(err) => {
                warn!("import failed, loading the blank karte: {err}");
                self.show(template::blank_karte());
                Err(err.into())
            }
        }
    }

    fn export(&self) -> Result<Vec<u8>, KarteError> {
        let grid = self.widget.read_grid()?;
        Ok(codec::build_workbook(&grid, &merged_regions(&grid))?)
    }

    fn status(&self) -> SessionStatus {
        let now = Timestamp::now();
        let (record_id, editors, unsaved_changes) = match &self.open {
            Some(open) => (
                Some(open.id.clone()),
                presence::active(&open.editors, now, self.presence.ttl()),
                open.has_unsaved_changes(),
            ),
            None => (None, Vec::new(), true),
        };

        SessionStatus {
            editor_id: self.presence.editor().clone(),
            editor_name: self.presence.name().to_string(),
            record_id,
            grid: self.widget.read_grid().unwrap_or_default(),
            editors,
            unsaved_changes,
            last_saved: self.last_saved,
            alert: self.alert.clone(),
            remote_loads: self.remote_loads,
        }
    }

    async fn on_store_event(&mut self, event: Option<StoreEvent>) {
        match event {
            None => {
                warn!("record store closed the subscription");
                if let Some(open) = self.open.as_mut() {
                    open.subscription = None;
                }
            }
            Some(StoreEvent::Deleted(id)) => {
                warn!("karte {id} was deleted while open");
                self.teardown(false).await;
                self.last_saved = None;
                self.show(template::blank_karte());
                self.alert = Some(format!("karte `{id}` was deleted"));
            }
            Some(StoreEvent::Changed(snapshot)) => {
                let Some(open) = self.open.as_mut() else {
                    return;
                };
                let delivery = open.echo.classify(
                    snapshot.document.origin(),
                    snapshot.last_updated,
                    Instant::now(),
                );
                match delivery {
                    Delivery::Apply => self.apply_remote(snapshot.into_record()),
                    Delivery::Echo => debug!("karte {}: own write {} echoed", open.id, snapshot.last_updated),
                    Delivery::Stale => debug!("karte {}: stale version {} dropped", open.id, snapshot.last_updated),
                    Delivery::Deferred => debug!(
                        "karte {}: version {} deferred until the suppression window closes",
                        open.id, snapshot.last_updated
                    ),
                }
            }
        }
    }

    /// Show a newer version written elsewhere, keeping unsaved local cells.
    fn apply_remote(&mut self, record: Record) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        open.editors = record.active_editors;
        if open.restructured {
            warn!(
                "karte {}: keeping the locally restructured grid over remote version {}",
                open.id, record.last_updated
            );
            return;
        }

        let mut incoming = record.grid;
        for (&(row, col), value) in &open.dirty {
            incoming.set(row, col, value.clone());
        }
        let id = open.id.clone();
        let kept = open.dirty.len();

        if let Ok(current) = self.widget.read_grid() {
            if current.same_content(&incoming) {
                debug!("karte {id}: remote version {} changes no cells", record.last_updated);
                return;
            }
        }

        self.remote_loads += 1;
        self.last_saved = Some(record.last_updated);
        info!(
            "karte {id}: applied remote version {} ({kept} local edits kept)",
            record.last_updated
        );
        self.show(incoming);
    }

    /// The suppression window closed; re-read if a write may have been missed.
    async fn close_window(&mut self) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        if !open.echo.expire_window(Instant::now()) {
            return;
        }
        let id = open.id.clone();
        info!("karte {id}: re-reading after a write seen during the suppression window");

        match self.store.get(&id).await {
            Ok(snapshot) => {
                let Some(open) = self.open.as_mut() else {
                    return;
                };
                if snapshot.last_updated > open.echo.last_applied() {
                    open.echo.loaded(snapshot.last_updated);
                    self.apply_remote(snapshot.into_record());
                }
            }
            Err(err) => {
                warn!("karte {id}: re-read failed: {err}");
                self.alert = Some(err.to_string());
            }
        }
    }

    async fn heartbeat(&mut self) {
        if let Some(open) = &self.open {
            debug!("heartbeat on karte {}", open.id);
        }
        self.announce().await;
    }

    /// Write this editor's presence entry (open and heartbeat).
    async fn announce(&mut self) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        let seen = open.echo.last_applied();
        open.echo.begin_write();

        match self.presence.announce(self.store.as_ref(), &open.id).await {
            Ok(write) => {
                open.echo.finish_write(write.committed, Instant::now());
                let editors = write.editors;
                // The read may carry a version this session has not shown yet.
                if write.read.last_updated > seen {
                    self.apply_remote(write.read);
                }
                if let Some(open) = self.open.as_mut() {
                    open.editors = editors;
                }
            }
            Err(err) => {
                open.echo.abort_write(Instant::now());
                warn!("karte {}: presence update failed: {err}", open.id);
                self.alert = Some(err.to_string());
            }
        }
    }

    /// Close the open record: stop the heartbeat, withdraw presence, unsubscribe.
    async fn teardown(&mut self, withdraw: bool) {
        self.recalc_at = None;
        let Some(open) = self.open.take() else {
            return;
        };
        let OpenRecord {
            id,
            subscription,
            heartbeat,
            autosave_at,
            ..
        } = open;

        drop(heartbeat);
        if autosave_at.is_some() {
            info!("karte {id}: pending autosave cancelled");
        }
        if withdraw {
            if let Err(err) = self.presence.withdraw(self.store.as_ref(), &id).await {
                warn!("karte {id}: could not withdraw presence: {err}");
            }
        }
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        info!("closed karte {id}");
    }
}

async fn next_event(subscription: Option<&mut Subscription>) -> Option<StoreEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(heartbeat: Option<&mut Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::StoreError;
    use crate::grid::MemoryGrid;
    use crate::store::MemoryStore;

    fn spawn(store: &Arc<MemoryStore>, widget: MemoryGrid) -> SessionHandle {
        let store: Arc<dyn RecordStore> = store.clone();
        EditingSession::spawn(store, widget, "Aoki", SessionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn starts_on_a_blank_karte() {
        let store = Arc::new(MemoryStore::new("karte"));
        let session = spawn(&store, MemoryGrid::new());

        let status = session.status().await.unwrap();
        assert_eq!(status.record_id, None);
        assert!(status.grid.same_content(&template::blank_karte()));
        assert_eq!(status.grid.row_count(), 31);
        assert_eq!(status.editor_name, "Aoki");
    }

    #[tokio::test(start_paused = true)]
    async fn first_save_creates_the_record_and_subscribes() {
        let store = Arc::new(MemoryStore::new("karte"));
        let session = spawn(&store, MemoryGrid::new());

        session.edit("E9", "2,000").await.unwrap();
        let id = session.save().await.unwrap();

        let stored = store.get(&id).await.unwrap().into_record();
        assert_eq!(stored.grid.get(8, 4), "2,000");
        // The pending recalculation ran before the save.
        assert_eq!(stored.grid.get(12, 4), "2000");
        assert!(stored.active_editors.contains_key(session.editor_id()));

        let status = session.status().await.unwrap();
        assert_eq!(status.record_id, Some(id));
        assert!(!status.unsaved_changes);
        assert_eq!(status.editors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn edits_are_autosaved_after_the_debounce() {
        let store = Arc::new(MemoryStore::new("karte"));
        let session = spawn(&store, MemoryGrid::new());
        let id = session.save().await.unwrap();

        session.edit("E9", "10").await.unwrap();
        session.edit("E9", "100").await.unwrap();
        assert!(session.status().await.unwrap().unsaved_changes);

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(store.get(&id).await.unwrap().into_record().grid.get(8, 4), "");

        tokio::time::sleep(Duration::from_millis(500)).await;
        let stored = store.get(&id).await.unwrap().into_record();
        assert_eq!(stored.grid.get(8, 4), "100");
        assert_eq!(stored.grid.get(12, 4), "100");
        assert!(!session.status().await.unwrap().unsaved_changes);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_records_cancels_the_pending_autosave() {
        let store = Arc::new(MemoryStore::new("karte"));
        let session = spawn(&store, MemoryGrid::new());
        let first = session.save().await.unwrap();
        session.new_record().await.unwrap();
        let second = session.save().await.unwrap();

        session.open(first.clone()).await.unwrap();
        session.edit("E9", "999").await.unwrap();
        session.open(second).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stored = store.get(&first).await.unwrap().into_record();
        assert_eq!(stored.grid.get(8, 4), "");
        assert!(!stored.active_editors.contains_key(session.editor_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_record_is_reported_as_not_found() {
        let store = Arc::new(MemoryStore::new("karte"));
        let session = spawn(&store, MemoryGrid::new());

        let err = session.open(RecordId::from("nope")).await.unwrap_err();
        assert!(matches!(err, KarteError::NotFound(_)));
        let status = session.status().await.unwrap();
        assert_eq!(status.alert.as_deref(), Some("karte `nope` was not found"));

        session.dismiss_alert().await.unwrap();
        assert_eq!(session.status().await.unwrap().alert, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_import_falls_back_to_the_template() {
        let store = Arc::new(MemoryStore::new("karte"));
        let session = spawn(&store, MemoryGrid::new());
        session.edit("A1", "scribble").await.unwrap();

        let err = session.import(b"not a workbook".to_vec()).await.unwrap_err();
        assert!(matches!(err, KarteError::Parse(_)));
        let status = session.status().await.unwrap();
        assert!(status.grid.same_content(&template::blank_karte()));
        assert!(status.alert.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn render_errors_are_returned_but_not_alerted() {
        let store = Arc::new(MemoryStore::new("karte"));
        let session = spawn(&store, MemoryGrid::detached());

        let err = session.set_cell(0, 0, "x").await.unwrap_err();
        assert!(matches!(err, KarteError::Render(_)));
        assert_eq!(session.status().await.unwrap().alert, None);

        assert!(matches!(
            session.edit("not-a-cell", "x").await,
            Err(KarteError::InvalidCell(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_store_sets_the_alert_and_keeps_edits() {
        let store = Arc::new(MemoryStore::new("karte"));
        let session = spawn(&store, MemoryGrid::new());
        session.save().await.unwrap();

        store.set_online(false);
        session.edit("E9", "5").await.unwrap();
        let err = session.save().await.unwrap_err();
        assert!(matches!(err, KarteError::Store(StoreError::Unavailable(_))));

        let status = session.status().await.unwrap();
        assert!(status.alert.is_some());
        assert!(status.unsaved_changes);
        assert_eq!(status.grid.get(8, 4), "5");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_withdraws_presence() {
        let store = Arc::new(MemoryStore::new("karte"));
        let session = spawn(&store, MemoryGrid::new());
        let id = session.save().await.unwrap();

        session.shutdown().await.unwrap();
        let stored = store.get(&id).await.unwrap().into_record();
        assert!(stored.active_editors.is_empty());
        assert!(matches!(session.status().await, Err(KarteError::SessionClosed)));
    }
}
