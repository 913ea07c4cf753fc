//! Hop-chain resolution
//!
//! Walks a target's `hop` links back towards the bastion and produces the dial
//! plan ordered from the bastion outward. The ACL is checked for every host on
//! the way, so nothing is dialed unless the user may reach every hop.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use super::config::DialSpec;
use super::error::SshError;
use crate::acl::{check_acls, AclAction};
use crate::crypto::SecretBox;
use crate::store::{Host, RecordStore, User};

pub struct HopChainResolver<'a> {
    pub store: &'a dyn RecordStore,
    pub secrets: &'a SecretBox,
    pub acl_hook: Option<&'a str>,
    pub max_hops: usize,
}

impl HopChainResolver<'_> {
    /// Dial plan for `target`: first hop first, `target` last
    pub async fn resolve(&self, user: &User, target: Host) -> Result<Vec<DialSpec>, SshError> {
        let target_name = target.name.clone();
        let mut plan = VecDeque::new();
        let mut visited = HashSet::new();
        let mut current = target;

        loop {
            if !visited.insert(current.id) || plan.len() >= self.max_hops {
                return Err(SshError::HopCycle(target_name, self.max_hops));
            }

            match check_acls(self.store, user, &current, self.acl_hook).await? {
                AclAction::Allow => {}
                AclAction::Deny => {
                    debug!("ACL denies {} on hop {}", user.name, current.name);
                    return Err(SshError::AccessDenied);
                }
            }

            let hop_id = current.hop_id;
            plan.push_front(DialSpec::for_host(current, self.store, self.secrets).await?);

            match hop_id {
                None => break,
                Some(id) => {
                    current = self
                        .store
                        .host_by_id(id)
                        .await?
                        .ok_or_else(|| SshError::UnknownHost(format!("#{}", id)))?;
                }
            }
        }

        Ok(plan.into())
    }
}
