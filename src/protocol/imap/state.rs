use crate::protocol::imap::command::state::ImapCommand;

/// The IMAP connection automaton (RFC 3501 §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
    Closed,
}

impl ImapState {
    /// Command admissibility. Commands rejected here were still fully
    /// parsed, so the tagged BAD can echo the tag.
    pub fn allows(&self, command: &ImapCommand) -> bool {
        use ImapCommand::*;
        match command {
            // Any state; Unknown passes through for its tagged BAD.
            // ENABLE is permitted pre-authentication with a limited
            // (currently empty) result.
            Capability | Noop | Logout | Id { .. } | Unknown { .. } | Compress { .. }
            | Enable { .. } => matches!(
                self,
                ImapState::NotAuthenticated | ImapState::Authenticated | ImapState::Selected
            ),
            StartTls | Login { .. } | Authenticate { .. } => {
                matches!(self, ImapState::NotAuthenticated)
            }
            Select { .. } | Examine { .. } | Create { .. } | Delete { .. } | Rename { .. }
            | Subscribe { .. } | Unsubscribe { .. } | List { .. } | Lsub { .. }
            | Status { .. } | Append { .. } | Namespace | Unselect => {
                matches!(self, ImapState::Authenticated | ImapState::Selected)
            }
            Check | Close | Expunge | Search { .. } | Fetch { .. } | Store { .. }
            | Copy { .. } | Move { .. } | Uid { .. } | Idle => {
                matches!(self, ImapState::Selected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admissibility_matrix() {
        let na = ImapState::NotAuthenticated;
        let auth = ImapState::Authenticated;
        let sel = ImapState::Selected;

        assert!(na.allows(&ImapCommand::Capability));
        assert!(na.allows(&ImapCommand::StartTls));
        assert!(!auth.allows(&ImapCommand::StartTls));
        assert!(!sel.allows(&ImapCommand::Login {
            username: "u".into(),
            password: "p".into()
        }));

        assert!(!na.allows(&ImapCommand::Select { mailbox: "INBOX".into() }));
        assert!(auth.allows(&ImapCommand::Select { mailbox: "INBOX".into() }));
        // SELECT from Selected re-selects (releasing the current view)
        assert!(sel.allows(&ImapCommand::Select { mailbox: "INBOX".into() }));

        assert!(!auth.allows(&ImapCommand::Check));
        assert!(sel.allows(&ImapCommand::Check));
        assert!(sel.allows(&ImapCommand::Idle));
        assert!(!auth.allows(&ImapCommand::Idle));

        assert!(na.allows(&ImapCommand::Enable { capabilities: vec![] }));
        assert!(!ImapState::Logout.allows(&ImapCommand::Noop));
    }
}
