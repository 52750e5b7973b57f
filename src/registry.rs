// src/registry.rs

//! Session registry: the single place sessions are created.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::errors::Result;
use crate::store::{SessionRecord, Store};
use crate::types::WorkflowRef;

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    store: Arc<dyn Store>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Return the session for `(workflow, session_time)`, creating it with a
    /// fresh uuid if absent. Concurrent callers for one key all observe the
    /// same session.
    pub fn get_or_create_session(
        &self,
        workflow: &WorkflowRef,
        session_time: DateTime<Utc>,
    ) -> Result<(SessionRecord, bool)> {
        let (session, created) = self.store.insert_session_if_absent(workflow, session_time)?;
        if created {
            info!(
                session_id = %session.id,
                session_uuid = %session.uuid,
                workflow = %workflow,
                session_time = %session_time,
                "session created"
            );
        }
        Ok((session, created))
    }

    /// Lookup without creating.
    pub fn find(
        &self,
        workflow: &WorkflowRef,
        session_time: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>> {
        self.store.find_session(workflow, session_time)
    }
}
