//! Subscription permissions
//!
//! [`SubscriptionPermission`] is what a publisher sends; [`SubscriberGrants`]
//! is the form the up track manager checks against, keyed by subscriber
//! identity.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::participant::LocalParticipant;
use crate::types::{ParticipantId, ParticipantIdentity, TrackId};

/// Looks up a live participant by session ID
pub type ParticipantResolverById<'a> =
    &'a (dyn Fn(&ParticipantId) -> Option<Arc<dyn LocalParticipant>> + Sync);

/// Looks up a live participant by identity
pub type ParticipantResolverByIdentity<'a> =
    &'a (dyn Fn(&ParticipantIdentity) -> Option<Arc<dyn LocalParticipant>> + Sync);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionPermission {
    /// Every participant may subscribe to every track; `track_permissions` is ignored
    pub all_participants: bool,
    pub track_permissions: Vec<TrackPermission>,
}

/// Grant for one subscriber, addressed by identity, session ID or both
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackPermission {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_identity: Option<ParticipantIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_sid: Option<ParticipantId>,
    pub all_tracks: bool,
    pub track_sids: Vec<TrackId>,
}

impl TrackPermission {
    #[must_use]
    pub fn allows(&self, track_id: &TrackId) -> bool {
        self.all_tracks || self.track_sids.contains(track_id)
    }
}

/// Per-subscriber grants derived from a [`SubscriptionPermission`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubscriberGrants {
    #[default]
    Unrestricted,
    Restricted(HashMap<ParticipantIdentity, TrackPermission>),
}

impl SubscriberGrants {
    /// Derive grants, resolving entries that only carry a session ID.
    ///
    /// Entries that cannot be resolved are skipped. An entry with neither an
    /// identity nor an ID rejects the whole permission.
    pub fn parse(
        permission: &SubscriptionPermission,
        resolve_by_id: ParticipantResolverById<'_>,
    ) -> Result<Self> {
        if permission.all_participants {
            return Ok(Self::Unrestricted);
        }

        let mut grants = HashMap::with_capacity(permission.track_permissions.len());
        for entry in &permission.track_permissions {
            let identity = entry
                .participant_identity
                .as_ref()
                .filter(|identity| !identity.is_empty());
            let sid = entry.participant_sid.as_ref().filter(|sid| !sid.is_empty());

            let identity = match (identity, sid) {
                (Some(identity), Some(sid)) => {
                    match resolve_by_id(sid) {
                        Some(participant) if participant.identity() != *identity => warn!(
                            participant_identity = %identity,
                            participant_sid = %sid,
                            resolved_identity = %participant.identity(),
                            "participant identity mismatch in permission"
                        ),
                        Some(_) => {}
                        None => warn!(
                            participant_identity = %identity,
                            participant_sid = %sid,
                            "could not find participant by sid"
                        ),
                    }
                    identity.clone()
                }
                (Some(identity), None) => identity.clone(),
                (None, Some(sid)) => match resolve_by_id(sid) {
                    Some(participant) => participant.identity(),
                    None => {
                        warn!(participant_sid = %sid, "could not find participant by sid");
                        continue;
                    }
                },
                (None, None) => return Err(Error::PermissionNeedsIdentifier),
            };

            let mut grant = entry.clone();
            grant.participant_identity = Some(identity.clone());
            grants.insert(identity, grant);
        }

        Ok(Self::Restricted(grants))
    }

    #[must_use]
    pub fn has_permission(&self, track_id: &TrackId, identity: &ParticipantIdentity) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Restricted(grants) => grants.get(identity).is_some_and(|g| g.allows(track_id)),
        }
    }

    /// Identities allowed on `track_id`, or `None` when everyone is
    #[must_use]
    pub fn allowed_subscribers(&self, track_id: &TrackId) -> Option<Vec<ParticipantIdentity>> {
        match self {
            Self::Unrestricted => None,
            Self::Restricted(grants) => Some(
                grants
                    .iter()
                    .filter(|(_, grant)| grant.allows(track_id))
                    .map(|(identity, _)| identity.clone())
                    .collect(),
            ),
        }
    }

    #[must_use]
    pub const fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Unrestricted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spreader::TrackSender;
    use crate::types::{ParticipantState, TrackInfo};

    struct Named {
        id: ParticipantId,
        identity: ParticipantIdentity,
    }

    impl LocalParticipant for Named {
        fn id(&self) -> ParticipantId {
            self.id.clone()
        }

        fn identity(&self) -> ParticipantIdentity {
            self.identity.clone()
        }

        fn state(&self) -> ParticipantState {
            ParticipantState::Active
        }

        fn subscription_permission_update(&self, _: &ParticipantId, _: &TrackId, _: bool) {}

        fn new_down_track(&self, _track: &TrackInfo) -> Result<Arc<dyn TrackSender>> {
            Err(Error::SubscriberUnavailable(self.id.to_string()))
        }
    }

    fn resolver(id: &ParticipantId) -> Option<Arc<dyn LocalParticipant>> {
        (id.as_str() == "PA_bob").then(|| {
            Arc::new(Named {
                id: id.clone(),
                identity: ParticipantIdentity::new("bob"),
            }) as Arc<dyn LocalParticipant>
        })
    }

    fn grant(identity: Option<&str>, sid: Option<&str>, tracks: &[&str]) -> TrackPermission {
        TrackPermission {
            participant_identity: identity.map(ParticipantIdentity::new),
            participant_sid: sid.map(ParticipantId::new),
            all_tracks: false,
            track_sids: tracks.iter().map(|t| TrackId::new(*t)).collect(),
        }
    }

    #[test]
    fn test_all_participants_ignores_grant_list() {
        let permission = SubscriptionPermission {
            all_participants: true,
            track_permissions: vec![grant(Some("alice"), None, &[])],
        };
        let grants = SubscriberGrants::parse(&permission, &resolver).unwrap();
        assert!(grants.is_unrestricted());
        assert!(grants.has_permission(&TrackId::new("TR_x"), &ParticipantIdentity::new("anyone")));
        assert!(grants.allowed_subscribers(&TrackId::new("TR_x")).is_none());
    }

    #[test]
    fn test_restricted_checks() {
        let mut everything = grant(Some("carol"), None, &[]);
        everything.all_tracks = true;
        let permission = SubscriptionPermission {
            all_participants: false,
            track_permissions: vec![grant(Some("alice"), None, &["TR_1"]), everything],
        };
        let grants = SubscriberGrants::parse(&permission, &resolver).unwrap();

        let t1 = TrackId::new("TR_1");
        let t2 = TrackId::new("TR_2");
        assert!(grants.has_permission(&t1, &ParticipantIdentity::new("alice")));
        assert!(!grants.has_permission(&t2, &ParticipantIdentity::new("alice")));
        assert!(grants.has_permission(&t2, &ParticipantIdentity::new("carol")));
        assert!(!grants.has_permission(&t1, &ParticipantIdentity::new("dave")));

        let mut allowed = grants.allowed_subscribers(&t1).unwrap();
        allowed.sort();
        assert_eq!(
            allowed,
            vec![ParticipantIdentity::new("alice"), ParticipantIdentity::new("carol")]
        );
    }

    #[test]
    fn test_sid_only_entries_are_resolved() {
        let permission = SubscriptionPermission {
            all_participants: false,
            track_permissions: vec![
                grant(None, Some("PA_bob"), &["TR_1"]),
                grant(None, Some("PA_ghost"), &["TR_1"]),
            ],
        };
        let grants = SubscriberGrants::parse(&permission, &resolver).unwrap();
        assert!(grants.has_permission(&TrackId::new("TR_1"), &ParticipantIdentity::new("bob")));
        assert_eq!(grants.allowed_subscribers(&TrackId::new("TR_1")).unwrap().len(), 1);
    }

    #[test]
    fn test_entry_identity_wins_on_mismatch() {
        let permission = SubscriptionPermission {
            all_participants: false,
            track_permissions: vec![grant(Some("robert"), Some("PA_bob"), &["TR_1"])],
        };
        let grants = SubscriberGrants::parse(&permission, &resolver).unwrap();
        assert!(grants.has_permission(&TrackId::new("TR_1"), &ParticipantIdentity::new("robert")));
        assert!(!grants.has_permission(&TrackId::new("TR_1"), &ParticipantIdentity::new("bob")));
    }

    #[test]
    fn test_entry_without_identifier_rejects_update() {
        let permission = SubscriptionPermission {
            all_participants: false,
            track_permissions: vec![grant(Some("alice"), None, &["TR_1"]), grant(None, Some(""), &[])],
        };
        assert_eq!(
            SubscriberGrants::parse(&permission, &resolver).unwrap_err(),
            Error::PermissionNeedsIdentifier
        );
    }

    #[test]
    fn test_wire_format() {
        let permission: SubscriptionPermission = serde_json::from_str(
            r#"{"track_permissions":[{"participant_identity":"B","track_sids":["T2"]}]}"#,
        )
        .unwrap();
        assert!(!permission.all_participants);
        assert_eq!(permission.track_permissions[0], grant(Some("B"), None, &["T2"]));
    }
}
