//! Stub collaborators shared by the unit tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use jsonwebtoken::{EncodingKey, Header, encode};

use crate::auth::Claims;
use crate::broker::message::{CommunityId, UserId};
use crate::community::MembershipChecker;
use crate::llm::LanguageModel;
use crate::persistence::{AiLogEntry, AiLogStore};
use crate::utils::error::{MembershipError, ModelError, PersistenceError};

pub const TEST_SECRET: &str = "test-secret";

pub fn token_for(user_id: UserId, role: &str) -> String {
    let claims = Claims {
        sub: user_id,
        role: role.to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Answers every question with the same text, or fails when `None`.
pub struct StubModel {
    pub answer: Option<String>,
    pub questions: Mutex<Vec<String>>,
}

impl StubModel {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            questions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn answer(&self, question: &str) -> Result<String, ModelError> {
        self.questions.lock().unwrap().push(question.to_string());
        self.answer
            .clone()
            .ok_or_else(|| ModelError::Request("model offline".to_string()))
    }
}

#[derive(Default)]
pub struct MemoryLog {
    pub entries: Mutex<Vec<AiLogEntry>>,
    pub fail: bool,
}

impl MemoryLog {
    pub fn failing() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn entries(&self) -> Vec<AiLogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiLogStore for MemoryLog {
    async fn record(&self, entry: &AiLogEntry) -> Result<(), PersistenceError> {
        if self.fail {
            let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
            return Err(PersistenceError::Serialization(err));
        }
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

/// Fixed set of (user, community) memberships.
#[derive(Default)]
pub struct StaticMembership {
    members: HashSet<(UserId, CommunityId)>,
    pub unreachable: bool,
}

impl StaticMembership {
    pub fn with(members: &[(UserId, CommunityId)]) -> Self {
        Self {
            members: members.iter().copied().collect(),
            unreachable: false,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            members: HashSet::new(),
            unreachable: true,
        }
    }
}

#[async_trait]
impl MembershipChecker for StaticMembership {
    async fn is_member(
        &self,
        user_id: UserId,
        community_id: CommunityId,
    ) -> Result<bool, MembershipError> {
        if self.unreachable {
            return Err(MembershipError::UnexpectedStatus(503));
        }
        Ok(self.members.contains(&(user_id, community_id)))
    }
}
