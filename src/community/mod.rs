//! Community membership lookup.
//!
//! Membership lives in the platform's relational store; the gateway asks the
//! platform's REST API before binding a socket to a community.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::broker::message::{CommunityId, UserId};
use crate::config::MembershipSettings;
use crate::utils::error::MembershipError;

#[async_trait]
pub trait MembershipChecker: Send + Sync {
    async fn is_member(
        &self,
        user_id: UserId,
        community_id: CommunityId,
    ) -> Result<bool, MembershipError>;
}

/// `GET {base_url}/communities/{community}/members/{user}`:
/// success means member, 404 means not a member.
pub struct HttpMembership {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMembership {
    pub fn new(settings: &MembershipSettings) -> Result<Self, MembershipError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| MembershipError::Lookup(e.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn member_url(&self, user_id: UserId, community_id: CommunityId) -> String {
        format!(
            "{}/communities/{}/members/{}",
            self.base_url, community_id, user_id
        )
    }
}

#[async_trait]
impl MembershipChecker for HttpMembership {
    async fn is_member(
        &self,
        user_id: UserId,
        community_id: CommunityId,
    ) -> Result<bool, MembershipError> {
        let response = self
            .client
            .get(self.member_url(user_id, community_id))
            .send()
            .await
            .map_err(|e| MembershipError::Lookup(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(MembershipError::UnexpectedStatus(status.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_url_is_built_from_base() {
        let membership = HttpMembership::new(&MembershipSettings {
            base_url: "http://platform/api/".to_string(),
            timeout_secs: 1,
        })
        .unwrap();
        assert_eq!(
            membership.member_url(42, 7),
            "http://platform/api/communities/7/members/42"
        );
    }
}
