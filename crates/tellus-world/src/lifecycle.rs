//! Monotone entity lifecycles.
//!
//! Every entity carries a status drawn from a small, domain-specific
//! lifecycle. Statuses form a partial order expressed by a rank: a move is
//! forward when the target rank is strictly greater and the current
//! status is not terminal. Terminal siblings share a rank, so
//! `completed` and `failed` are incomparable and neither can follow the
//! other.
//!
//! Registries only ever apply forward moves from inside `update`. Moving
//! backward requires the explicit
//! [`Registry::reset_status`](crate::registry::Registry::reset_status).

use std::fmt::Debug;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A status type with a documented forward-only order.
pub trait Lifecycle:
    Copy + Eq + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Position in the partial order.
    fn rank(self) -> u8;

    /// Whether no further transition is possible.
    fn is_terminal(self) -> bool;

    /// Stable `snake_case` label (matches the serialized form).
    fn label(self) -> &'static str;

    /// Whether `self -> next` is a forward move.
    fn can_advance_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Declares a lifecycle enum with its ranks, labels, and terminal flags.
macro_rules! lifecycle {
    (
        $(#[$meta:meta])*
        $name:ident, initial = $initial:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident => ($rank:expr, $label:literal, $terminal:expr)
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $(
                $(#[$vmeta])*
                $variant,
            )+
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$initial
            }
        }

        impl Lifecycle for $name {
            fn rank(self) -> u8 {
                match self {
                    $(Self::$variant => $rank,)+
                }
            }

            fn is_terminal(self) -> bool {
                match self {
                    $(Self::$variant => $terminal,)+
                }
            }

            fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }
    };
}

lifecycle! {
    /// Crisis lifecycle: `active -> contained -> resolved`.
    CrisisStatus, initial = Active {
        /// Ongoing and possibly escalating.
        Active => (0, "active", false),
        /// Mitigated but not yet over.
        Contained => (1, "contained", false),
        /// Over for good.
        Resolved => (2, "resolved", true),
    }
}

lifecycle! {
    /// Crisis response lifecycle: `planned -> active -> {completed, failed}`.
    ResponseStatus, initial = Planned {
        /// Declared, nobody working on it yet.
        Planned => (0, "planned", false),
        /// Participants are working on it.
        Active => (1, "active", false),
        /// Reached its goal.
        Completed => (2, "completed", true),
        /// Gave up.
        Failed => (2, "failed", true),
    }
}

lifecycle! {
    /// Generic institution lifecycle: `founding -> established -> defunct`.
    Establishment, initial = Founding {
        /// Recently created, not yet self-sustaining.
        Founding => (0, "founding", false),
        /// Operating normally.
        Established => (1, "established", false),
        /// Closed, extinct, or abandoned.
        Defunct => (2, "defunct", true),
    }
}

lifecycle! {
    /// Law lifecycle: `proposed -> enacted -> repealed`.
    LawStatus, initial = Proposed {
        /// Written down but lacking acceptance.
        Proposed => (0, "proposed", false),
        /// In force.
        Enacted => (1, "enacted", false),
        /// No longer in force.
        Repealed => (2, "repealed", true),
    }
}

lifecycle! {
    /// Criminal case lifecycle: `open -> on_trial -> closed`.
    CaseStatus, initial = Open {
        /// Reported, under investigation.
        Open => (0, "open", false),
        /// Being judged.
        OnTrial => (1, "on_trial", false),
        /// Judged.
        Closed => (2, "closed", true),
    }
}

lifecycle! {
    /// Social structure ladder of a group, from band to nation.
    SocialStructure, initial = Band {
        /// A small band.
        Band => (0, "band", false),
        /// A tribe.
        Tribe => (1, "tribe", false),
        /// A chiefdom.
        Chiefdom => (2, "chiefdom", false),
        /// A kingdom.
        Kingdom => (3, "kingdom", false),
        /// An empire.
        Empire => (4, "empire", false),
        /// A nation.
        Nation => (5, "nation", true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_moves_only() {
        assert!(CrisisStatus::Active.can_advance_to(CrisisStatus::Contained));
        assert!(CrisisStatus::Active.can_advance_to(CrisisStatus::Resolved));
        assert!(!CrisisStatus::Contained.can_advance_to(CrisisStatus::Active));
        assert!(!CrisisStatus::Resolved.can_advance_to(CrisisStatus::Active));
    }

    #[test]
    fn terminal_siblings_are_incomparable() {
        assert!(!ResponseStatus::Completed.can_advance_to(ResponseStatus::Failed));
        assert!(!ResponseStatus::Failed.can_advance_to(ResponseStatus::Completed));
        assert!(ResponseStatus::Active.can_advance_to(ResponseStatus::Failed));
    }

    #[test]
    fn labels_match_serialized_form() {
        assert_eq!(CaseStatus::OnTrial.label(), "on_trial");
        assert_eq!(
            serde_json::to_string(&CaseStatus::OnTrial).ok().as_deref(),
            Some("\"on_trial\"")
        );
        assert_eq!(SocialStructure::default(), SocialStructure::Band);
    }
}
