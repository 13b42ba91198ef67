//! Change feeds over table selections
//!
//! A feed without `limit`/`skip` reports every write touching a matching
//! document. A windowed feed re-evaluates its window after each write and
//! reports the difference keyed by primary key.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tracing::{debug, warn};

use docstore_common::driver::ChangeFeed;
use docstore_common::error::{Result, StorageError};
use docstore_common::query::{Projection, Selection, Selector, Transform};
use docstore_common::types::ChangeEvent;

use crate::table::{DocChange, Table, TableWrite};
use crate::value::{matches, pluck, values_equal};

enum Mode {
    /// Per-write events filtered by the selector
    Writes { selector: Selector },
    /// Diff of a shaped window
    Window { selection: Selection, window: Vec<Value> },
}

struct FeedState {
    table: Arc<Table>,
    rx: Receiver<Arc<TableWrite>>,
    mode: Mode,
    projection: Option<Projection>,
    pending: VecDeque<ChangeEvent>,
}

/// Open a change feed on `selection` of `table`
pub(crate) fn open(table: Arc<Table>, selection: Selection) -> Result<ChangeFeed> {
    let rx = table.subscribe()?;

    let projection = selection.transforms.iter().find_map(|t| match t {
        Transform::Pluck(p) => Some(p.clone()),
        _ => None,
    });

    let mode = if selection.is_windowed() {
        let shaping = selection
            .transforms
            .iter()
            .filter(|t| !matches!(t, Transform::Pluck(_)))
            .cloned()
            .collect();
        let selection = Selection {
            transforms: shaping,
            ..selection
        };
        let window = table.select(&selection)?;
        Mode::Window { selection, window }
    } else {
        Mode::Writes {
            selector: selection.selector,
        }
    };

    debug!("Opened change feed on {}", table.name());

    let state = FeedState {
        table,
        rx,
        mode,
        projection,
        pending: VecDeque::new(),
    };

    Ok(stream::unfold(state, |mut state| async move {
        let item = state.next().await?;
        Some((item, state))
    })
    .boxed())
}

impl FeedState {
    async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }

            match self.rx.recv().await {
                Ok(write) => {
                    if let Err(e) = self.absorb(&write) {
                        return Some(Err(e));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    if let Mode::Writes { .. } = self.mode {
                        warn!("Change feed on {} lagged by {} writes", self.table.name(), skipped);
                        return Some(Err(StorageError::FeedLagged(skipped).into()));
                    }
                    if let Err(e) = self.refresh_window() {
                        return Some(Err(e));
                    }
                }
                Err(RecvError::Closed) => {
                    debug!("Change feed on {} closed", self.table.name());
                    return None;
                }
            }
        }
    }

    fn absorb(&mut self, write: &TableWrite) -> Result<()> {
        let Mode::Writes { selector } = &self.mode else {
            return self.refresh_window();
        };

        let primary_key = self.table.primary_key();
        let projection = &self.projection;
        let keep = |doc: &Option<Value>| {
            doc.as_ref()
                .filter(|d| selected(d, selector, primary_key))
                .map(|d| project(projection, d))
        };

        for DocChange { old, new } in &write.changes {
            let old_val = keep(old);
            let new_val = keep(new);
            let unchanged = match (&old_val, &new_val) {
                (None, None) => true,
                (Some(a), Some(b)) => values_equal(a, b),
                _ => false,
            };
            if !unchanged {
                self.pending.push_back(ChangeEvent { new_val, old_val });
            }
        }
        Ok(())
    }

    fn refresh_window(&mut self) -> Result<()> {
        let Mode::Window { selection, window } = &mut self.mode else {
            return Ok(());
        };
        let next = self.table.select(selection)?;
        let primary_key = self.table.primary_key();
        let key_of = |doc: &Value| doc.get(primary_key).cloned().unwrap_or(Value::Null);

        for old in window.iter() {
            let id = key_of(old);
            if !next.iter().any(|doc| values_equal(&key_of(doc), &id)) {
                self.pending
                    .push_back(ChangeEvent::delete(project(&self.projection, old)));
            }
        }

        for new in &next {
            let id = key_of(new);
            let event = match window.iter().find(|doc| values_equal(&key_of(doc), &id)) {
                None => Some(ChangeEvent::insert(project(&self.projection, new))),
                Some(old) => {
                    let old = project(&self.projection, old);
                    let new = project(&self.projection, new);
                    (!values_equal(&old, &new)).then(|| ChangeEvent::update(old, new))
                }
            };
            self.pending.extend(event);
        }

        *window = next;
        Ok(())
    }
}

fn selected(doc: &Value, selector: &Selector, primary_key: &str) -> bool {
    match selector {
        Selector::All => true,
        Selector::Filter(filter) => matches(doc, filter),
        Selector::Key(id) => doc.get(primary_key).map_or(false, |k| values_equal(k, id)),
    }
}

fn project(projection: &Option<Projection>, doc: &Value) -> Value {
    match projection {
        Some(p) => pluck(doc, p),
        None => doc.clone(),
    }
}
