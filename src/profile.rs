//! Seccomp-style syscall allow-lists derived from observed syscalls.

use serde::{Deserialize, Serialize};

pub const ACTION_ALLOW: &str = "SCMP_ACT_ALLOW";
pub const ACTION_ERRNO: &str = "SCMP_ACT_ERRNO";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyscallProfile {
    pub default_action: String,
    pub syscalls: Vec<SyscallRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRule {
    pub names: Vec<String>,
    pub action: String,
}

impl SyscallProfile {
    /// Builds a profile that allows exactly the given syscalls and denies
    /// everything else. Names are deduplicated and sorted.
    pub fn allow_only<I, S>(syscalls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = syscalls.into_iter().map(Into::into).collect();
        names.sort_unstable();
        names.dedup();

        let syscalls = if names.is_empty() {
            Vec::new()
        } else {
            vec![SyscallRule {
                names,
                action: ACTION_ALLOW.to_owned(),
            }]
        };

        Self {
            default_action: ACTION_ERRNO.to_owned(),
            syscalls,
        }
    }

    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.syscalls
            .iter()
            .filter(|rule| rule.action == ACTION_ALLOW)
            .flat_map(|rule| rule.names.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_is_sorted_and_deduplicated() {
        let profile = SyscallProfile::allow_only(["write", "read", "write"]);
        assert_eq!(profile.default_action, ACTION_ERRNO);
        assert_eq!(profile.allowed().collect::<Vec<_>>(), vec!["read", "write"]);
    }

    #[test]
    fn empty_observation_denies_everything() {
        let profile = SyscallProfile::allow_only(Vec::<String>::new());
        assert!(profile.syscalls.is_empty());
    }

    #[test]
    fn serializes_in_seccomp_layout() {
        let profile = SyscallProfile::allow_only(["read"]);
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "defaultAction": "SCMP_ACT_ERRNO",
                "syscalls": [{ "names": ["read"], "action": "SCMP_ACT_ALLOW" }]
            })
        );
    }
}
