// Advisory per-document locks.
//
// Locks live in server memory only and die with their owning connection.
// They never gate writes; the store accepts any mutation and the editing
// convention is enforced client-side.

use std::collections::HashMap;

use trellis_common::types::{ClientId, DocPath, LockMode};
use uuid::Uuid;

/// Connection identity; one per socket, distinct from the client identity
/// that is reported as the lock holder.
pub type ConnId = Uuid;

#[derive(Debug, Clone, PartialEq)]
struct Holder {
    conn: ConnId,
    client: ClientId,
    mode: LockMode,
}

/// What a lock request produced.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    Granted,
    /// Denied by a hard lock elsewhere: who holds it, and how.
    Denied { holder: ClientId, mode: LockMode },
}

#[derive(Debug, Default)]
pub struct LockManager {
    // Holders per path, in acquisition order; the most recent soft holder
    // is the active one.
    locks: HashMap<DocPath, Vec<Holder>>,
}

impl LockManager {
    /// Acquire or refresh a lock.
    ///
    /// A hard lock held by another connection denies the request. Granting
    /// a hard lock displaces existing soft holders (soft locks may only
    /// coexist while no hard lock exists). Re-acquiring by the same
    /// connection overwrites the mode.
    pub fn lock(
        &mut self,
        path: &DocPath,
        conn: ConnId,
        client: ClientId,
        mode: LockMode,
    ) -> LockOutcome {
        let holders = self.locks.entry(path.clone()).or_default();

        if let Some(hard) =
            holders.iter().find(|h| h.mode == LockMode::Hard && h.conn != conn)
        {
            return LockOutcome::Denied { holder: hard.client, mode: hard.mode };
        }

        holders.retain(|h| h.conn != conn);
        if mode == LockMode::Hard {
            holders.clear();
        }
        holders.push(Holder { conn, client, mode });
        LockOutcome::Granted
    }

    /// Release the caller's hold, if any. Releasing a lock someone else
    /// holds (or none at all) is a silent no-op so disconnect races never
    /// surface as errors.
    pub fn unlock(&mut self, path: &DocPath, conn: ConnId) {
        if let Some(holders) = self.locks.get_mut(path) {
            holders.retain(|h| h.conn != conn);
            if holders.is_empty() {
                self.locks.remove(path);
            }
        }
    }

    /// Drop every lock the connection holds.
    pub fn release_connection(&mut self, conn: ConnId) {
        self.locks.retain(|_, holders| {
            holders.retain(|h| h.conn != conn);
            !holders.is_empty()
        });
    }

    /// The holder surfaced for UI purposes: the hard holder when one
    /// exists, otherwise the most recent soft holder.
    pub fn active_holder(&self, path: &DocPath) -> Option<(ClientId, LockMode)> {
        let holders = self.locks.get(path)?;
        holders
            .iter()
            .find(|h| h.mode == LockMode::Hard)
            .or_else(|| holders.last())
            .map(|h| (h.client, h.mode))
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ConnId, ClientId) {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn hard_lock_excludes_other_connections() {
        let mut locks = LockManager::default();
        let path = DocPath::new("b", "block-1");
        let (conn_a, client_a) = ids();
        let (conn_b, client_b) = ids();

        assert_eq!(locks.lock(&path, conn_a, client_a, LockMode::Hard), LockOutcome::Granted);
        assert_eq!(
            locks.lock(&path, conn_b, client_b, LockMode::Hard),
            LockOutcome::Denied { holder: client_a, mode: LockMode::Hard }
        );
        assert_eq!(
            locks.lock(&path, conn_b, client_b, LockMode::Soft),
            LockOutcome::Denied { holder: client_a, mode: LockMode::Hard }
        );

        // Release-on-disconnect lets the other side in.
        locks.release_connection(conn_a);
        assert_eq!(locks.lock(&path, conn_b, client_b, LockMode::Hard), LockOutcome::Granted);
    }

    #[test]
    fn soft_locks_coexist_and_latest_is_active() {
        let mut locks = LockManager::default();
        let path = DocPath::new("b", "block-1");
        let (conn_a, client_a) = ids();
        let (conn_b, client_b) = ids();

        assert_eq!(locks.lock(&path, conn_a, client_a, LockMode::Soft), LockOutcome::Granted);
        assert_eq!(locks.lock(&path, conn_b, client_b, LockMode::Soft), LockOutcome::Granted);
        assert_eq!(locks.active_holder(&path), Some((client_b, LockMode::Soft)));

        // Refreshing moves the first holder back to the active slot.
        assert_eq!(locks.lock(&path, conn_a, client_a, LockMode::Soft), LockOutcome::Granted);
        assert_eq!(locks.active_holder(&path), Some((client_a, LockMode::Soft)));
    }

    #[test]
    fn granting_hard_displaces_soft_holders() {
        let mut locks = LockManager::default();
        let path = DocPath::new("b", "block-1");
        let (conn_a, client_a) = ids();
        let (conn_b, client_b) = ids();

        locks.lock(&path, conn_a, client_a, LockMode::Soft);
        assert_eq!(locks.lock(&path, conn_b, client_b, LockMode::Hard), LockOutcome::Granted);
        assert_eq!(locks.active_holder(&path), Some((client_b, LockMode::Hard)));

        // The displaced soft holder is simply gone.
        locks.release_connection(conn_b);
        assert_eq!(locks.active_holder(&path), None);
    }

    #[test]
    fn reacquire_overwrites_mode() {
        let mut locks = LockManager::default();
        let path = DocPath::new("b", "block-1");
        let (conn, client) = ids();

        locks.lock(&path, conn, client, LockMode::Soft);
        locks.lock(&path, conn, client, LockMode::Hard);
        assert_eq!(locks.active_holder(&path), Some((client, LockMode::Hard)));
    }

    #[test]
    fn unlock_by_non_holder_is_a_no_op() {
        let mut locks = LockManager::default();
        let path = DocPath::new("b", "block-1");
        let (conn_a, client_a) = ids();
        let (conn_b, _) = ids();

        locks.lock(&path, conn_a, client_a, LockMode::Hard);
        locks.unlock(&path, conn_b);
        assert_eq!(locks.active_holder(&path), Some((client_a, LockMode::Hard)));

        locks.unlock(&path, conn_a);
        assert_eq!(locks.active_holder(&path), None);
        assert_eq!(locks.len(), 0);
    }
}
