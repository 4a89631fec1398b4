//! Iterator role state machine.
//!
//! ```text
//!            promote(seq)
//!  Support ───────────────> Leader
//!     │                       │
//!     │ terminate()           │ terminate()
//!     └──────> Terminating <──┘
//! ```
//!
//! There is no way back from `Leader` to `Support` inside a process. The
//! supervisor demotes a redundant leader by terminating it; the restarted
//! process comes back as `Support`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::SeqNum;

/// Role of one iterator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Cross-references observations against the store.
    #[default]
    Support,
    /// Writes observations to the store unconditionally.
    Leader,
    /// Shutting down; absorbing.
    Terminating,
}

impl Role {
    /// Returns `true` for [`Role::Leader`].
    #[must_use]
    pub const fn is_leader(self) -> bool {
        matches!(self, Self::Leader)
    }

    /// Returns `true` for [`Role::Terminating`].
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        matches!(self, Self::Terminating)
    }

    /// Stable lowercase name, used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Support => "support",
            Self::Leader => "leader",
            Self::Terminating => "terminating",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected role transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RoleError {
    /// The transition is not part of the state machine.
    #[error("invalid role transition from {from} to {to}")]
    InvalidTransition {
        /// Current role.
        from: Role,
        /// Requested role.
        to: Role,
    },
}

/// Owner of an iterator's role. The only place a role changes.
#[derive(Debug, Clone)]
pub struct RoleMachine {
    role: Role,
}

impl RoleMachine {
    /// Starts a process in `initial`.
    ///
    /// # Errors
    ///
    /// A process cannot start in [`Role::Terminating`].
    pub fn new(initial: Role) -> Result<Self, RoleError> {
        if initial.is_terminating() {
            return Err(RoleError::InvalidTransition {
                from: Role::Support,
                to: Role::Terminating,
            });
        }
        Ok(Self { role: initial })
    }

    /// Current role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// `Support -> Leader`, triggered by an expired candidate at `at_seq`.
    ///
    /// # Errors
    ///
    /// Fails from any role other than `Support`.
    pub fn promote(&mut self, at_seq: SeqNum) -> Result<(), RoleError> {
        match self.role {
            Role::Support => {
                info!(seq = at_seq, "Promoting support to leader");
                self.role = Role::Leader;
                Ok(())
            },
            from => Err(RoleError::InvalidTransition {
                from,
                to: Role::Leader,
            }),
        }
    }

    /// Moves to `Terminating`. Repeating it is a no-op.
    ///
    /// Returns the role that was left.
    pub fn terminate(&mut self) -> Role {
        let previous = self.role;
        if !previous.is_terminating() {
            info!(from = %previous, "Iterator terminating");
            self.role = Role::Terminating;
        }
        previous
    }
}

impl Default for RoleMachine {
    fn default() -> Self {
        Self {
            role: Role::Support,
        }
    }
}
