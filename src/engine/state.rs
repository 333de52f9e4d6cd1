// Progress of the provisioning pipeline, rendered by the console UI.
#[derive(Clone, Debug, PartialEq)]
pub enum ProvisionState {
    Idle,
    Fetching {
        file: String,
        progress: f32,
        speed: String,
    },
    Extracting {
        file: String,
    },
    Installing {
        packages: usize,
    },
    Verifying,
    Configuring,
    Validating {
        preset: String,
    },
    Rejected {
        preset: String,
        reason: String,
    },
    Ready {
        version: String,
        preset: Option<String>,
    },
    Error(String),
}

impl ProvisionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisionState::Ready { .. } | ProvisionState::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ready_and_error_are_terminal() {
        assert!(ProvisionState::Error("x".into()).is_terminal());
        assert!(
            ProvisionState::Ready {
                version: "1.5.0".into(),
                preset: None
            }
            .is_terminal()
        );
        assert!(!ProvisionState::Verifying.is_terminal());
        assert!(!ProvisionState::Idle.is_terminal());
    }
}
