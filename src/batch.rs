use crate::backend::Session;
use crate::backup::{self, BackupLocation};
use crate::error::InceptionError;
use crate::model::OpidGenerator;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

// Idle -> Open -> Idle on flush, Open -> Draining -> Idle on abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Open { members: Vec<usize> },
    Draining { remaining: usize },
}

#[derive(Debug)]
pub struct BatchController {
    size: usize,
    backup: bool,
    state: BatchState,
    touched: BTreeSet<BackupLocation>,
}

impl BatchController {
    pub fn new(size: usize, backup: bool) -> Self {
        Self {
            size: size.max(1),
            backup,
            state: BatchState::Idle,
            touched: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    /// Single statements without backup run in autocommit.
    fn transactional(&self) -> bool {
        self.size > 1 || self.backup
    }

    /// Consumes one drain slot. True when the unit must be refused.
    pub fn take_drain_slot(&mut self) -> bool {
        let BatchState::Draining { remaining } = &mut self.state else {
            return false;
        };
        *remaining -= 1;
        if *remaining == 0 {
            self.state = BatchState::Idle;
        }
        true
    }

    pub async fn ensure_open(&mut self, session: &mut Session) -> Result<(), InceptionError> {
        if matches!(self.state, BatchState::Open { .. }) {
            return Ok(());
        }
        if self.transactional() {
            session.begin().await?;
        }
        debug!(size = self.size, "batch opened");
        self.state = BatchState::Open {
            members: Vec::new(),
        };
        self.touched.clear();
        Ok(())
    }

    pub fn admit(&mut self, member: usize, location: Option<BackupLocation>) {
        if let BatchState::Open { members } = &mut self.state {
            members.push(member);
        }
        if let Some(loc) = location {
            self.touched.insert(loc);
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(&self.state, BatchState::Open { members } if members.len() >= self.size)
    }

    pub async fn flush(
        &mut self,
        session: &mut Session,
        opids: &mut OpidGenerator,
    ) -> Result<Vec<usize>, InceptionError> {
        let BatchState::Open { members } = &self.state else {
            return Ok(Vec::new());
        };
        let members = members.clone();
        if self.backup && self.size > 1 && !members.is_empty() {
            for loc in &self.touched {
                backup::write_sentinel(session, loc, opids.next_sentinel()).await?;
            }
        }
        if self.transactional() {
            session.commit().await?;
        }
        info!(members = members.len(), "batch committed");
        self.state = BatchState::Idle;
        self.touched.clear();
        Ok(members)
    }

    /// Rolls the open batch back and starts draining its free slots. Returns
    /// the members whose work was undone, also when the rollback call itself
    /// fails: a lost connection takes its open transaction with it.
    pub async fn abort(
        &mut self,
        session: &mut Session,
    ) -> (Vec<usize>, Result<(), InceptionError>) {
        let BatchState::Open { members } = &self.state else {
            return (Vec::new(), Ok(()));
        };
        let members = members.clone();
        // The failed unit holds a slot of its own.
        let remaining = self.size.saturating_sub(members.len() + 1);
        self.state = if remaining == 0 {
            BatchState::Idle
        } else {
            BatchState::Draining { remaining }
        };
        self.touched.clear();
        warn!(members = members.len(), remaining, "batch rolled back");
        let rolled_back = if self.transactional() {
            session.rollback().await
        } else {
            Ok(())
        };
        (members, rolled_back)
    }

    /// Ends draining early: a DDL forces a batch boundary.
    pub fn reset_drain(&mut self) {
        if matches!(self.state, BatchState::Draining { .. }) {
            self.state = BatchState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Connector;
    use crate::config::SourceOptions;
    use crate::sandbox::SandboxConnector;
    use std::time::Duration;

    async fn session() -> anyhow::Result<Session> {
        let connector = SandboxConnector::temporary()?;
        let conn = connector.connect(&SourceOptions::default()).await?;
        Ok(Session::new(conn, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn full_batch_flushes_members_in_order() -> anyhow::Result<()> {
        let mut session = session().await?;
        let mut opids = OpidGenerator::new(1, 1);
        let mut batch = BatchController::new(2, false);
        batch.ensure_open(&mut session).await?;
        batch.admit(0, None);
        assert!(!batch.is_full());
        batch.admit(1, None);
        assert!(batch.is_full());
        assert_eq!(batch.flush(&mut session, &mut opids).await?, vec![0, 1]);
        assert_eq!(batch.state(), &BatchState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn abort_drains_the_rest_of_the_batch() -> anyhow::Result<()> {
        let mut session = session().await?;
        let mut batch = BatchController::new(3, false);
        batch.ensure_open(&mut session).await?;
        batch.admit(3, None);
        // Second member fails: one slot is left to drain.
        let (undone, rolled_back) = batch.abort(&mut session).await;
        rolled_back?;
        assert_eq!(undone, vec![3]);
        assert_eq!(batch.state(), &BatchState::Draining { remaining: 1 });
        assert!(batch.take_drain_slot());
        assert_eq!(batch.state(), &BatchState::Idle);
        assert!(!batch.take_drain_slot());
        Ok(())
    }

    #[tokio::test]
    async fn failing_last_slot_leaves_nothing_to_drain() -> anyhow::Result<()> {
        let mut session = session().await?;
        let mut batch = BatchController::new(2, false);
        batch.ensure_open(&mut session).await?;
        batch.admit(0, None);
        batch.abort(&mut session).await.1?;
        assert_eq!(batch.state(), &BatchState::Idle);
        Ok(())
    }
}
