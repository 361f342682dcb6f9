//! Subsystem kind classification.
//!
//! Which kinds are personality servers started *by* another subsystem, and
//! which may only run once per session, is policy rather than something the
//! image tells us. The table below holds that policy and can be replaced
//! through configuration.

use serde::{Deserialize, Serialize};
use smss_protocol::{LoadFlags, SubsystemKind};

/// Policy for one requested subsystem kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindPolicy {
    pub kind: SubsystemKind,
    /// Load flag that requests this kind.
    #[serde(with = "flag_name")]
    pub flag: LoadFlags,
    /// At most one live server of this kind per session.
    #[serde(default)]
    pub single_instance: bool,
    /// Kind of the already-running subsystem that starts this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_by: Option<SubsystemKind>,
}

/// Classification table consulted by the loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KindTable {
    policies: Vec<KindPolicy>,
}

impl Default for KindTable {
    fn default() -> Self {
        Self {
            policies: vec![
                KindPolicy {
                    kind: SubsystemKind::Posix,
                    flag: LoadFlags::POSIX,
                    single_instance: true,
                    hosted_by: Some(SubsystemKind::WindowsGui),
                },
                KindPolicy {
                    kind: SubsystemKind::Os2,
                    flag: LoadFlags::OS2,
                    single_instance: true,
                    hosted_by: Some(SubsystemKind::WindowsGui),
                },
            ],
        }
    }
}

impl KindTable {
    pub fn new(policies: Vec<KindPolicy>) -> Self {
        Self { policies }
    }

    /// Policy for the kind requested by `flags`, if any. The first matching
    /// entry wins.
    pub fn requested(&self, flags: LoadFlags) -> Option<&KindPolicy> {
        self.policies
            .iter()
            .find(|policy| !policy.flag.is_empty() && flags.contains(policy.flag))
    }

    /// Single-instance kind requested by `flags`, if any.
    pub fn single_instance(&self, flags: LoadFlags) -> Option<SubsystemKind> {
        self.requested(flags)
            .filter(|policy| policy.single_instance)
            .map(|policy| policy.kind)
    }

    /// Kind of the subsystem that must broker creation for `flags`.
    pub fn broker_for(&self, flags: LoadFlags) -> Option<SubsystemKind> {
        self.requested(flags).and_then(|policy| policy.hosted_by)
    }

    /// True if `flags` request a personality subsystem started by another one.
    pub fn is_hosted(&self, flags: LoadFlags) -> bool {
        self.broker_for(flags).is_some()
    }

    /// Flag of the policy whose flag is called `name`, ignoring case. Lets a
    /// directive named `Posix` request the POSIX kind.
    pub fn flag_named(&self, name: &str) -> Option<LoadFlags> {
        self.policies
            .iter()
            .find(|policy| {
                policy
                    .flag
                    .iter_names()
                    .any(|(flag, _)| flag.eq_ignore_ascii_case(name))
            })
            .map(|policy| policy.flag)
    }

    pub fn policies(&self) -> &[KindPolicy] {
        &self.policies
    }
}

mod flag_name {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use smss_protocol::LoadFlags;

    pub fn serialize<S: Serializer>(flag: &LoadFlags, serializer: S) -> Result<S::Ok, S::Error> {
        let name = flag
            .iter_names()
            .next()
            .map(|(name, _)| name.to_ascii_lowercase())
            .unwrap_or_default();
        serializer.serialize_str(&name)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LoadFlags, D::Error> {
        let name = String::deserialize(deserializer)?;
        LoadFlags::from_name(&name.to_ascii_uppercase())
            .ok_or_else(|| D::Error::custom(format!("unknown load flag '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_hosts_posix_and_os2_in_the_gui_subsystem() {
        let table = KindTable::default();
        assert_eq!(table.broker_for(LoadFlags::POSIX), Some(SubsystemKind::WindowsGui));
        assert_eq!(
            table.broker_for(LoadFlags::OS2 | LoadFlags::SUBSYSTEM),
            Some(SubsystemKind::WindowsGui)
        );
        assert_eq!(table.single_instance(LoadFlags::POSIX), Some(SubsystemKind::Posix));
        assert_eq!(table.broker_for(LoadFlags::SUBSYSTEM), None);
        assert!(!table.is_hosted(LoadFlags::empty()));
        assert_eq!(table.flag_named("Posix"), Some(LoadFlags::POSIX));
        assert_eq!(table.flag_named("Windows"), None);
    }

    #[test]
    fn table_can_be_overridden_from_json() {
        let json = r#"[
            {"kind": "posix", "flag": "posix", "singleInstance": false},
            {"kind": "os2", "flag": "os2", "singleInstance": true, "hostedBy": "windows-cui"}
        ]"#;
        let table: KindTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.broker_for(LoadFlags::POSIX), None);
        assert_eq!(table.single_instance(LoadFlags::POSIX), None);
        assert_eq!(table.broker_for(LoadFlags::OS2), Some(SubsystemKind::WindowsCui));

        let back = serde_json::to_value(&table).unwrap();
        assert_eq!(back[1]["flag"], "os2");
    }

    #[test]
    fn unknown_flag_name_is_rejected() {
        let json = r#"[{"kind": "posix", "flag": "fast"}]"#;
        assert!(serde_json::from_str::<KindTable>(json).is_err());
    }
}
