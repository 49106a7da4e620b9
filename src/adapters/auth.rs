//! Authorization Adapters
//!
//! `StaticTokenAuthorizer` treats a fixed set of principals (admin tokens or
//! user ids) as privileged. `AllowAll` grants everything, for deployments
//! that sit behind their own access control.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::domain::ports::Authorizer;

/// Authorizer backed by a static set of privileged principals.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthorizer {
    principals: HashSet<String>,
}

impl StaticTokenAuthorizer {
    pub fn new<I, S>(principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            principals: principals
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.trim().is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.principals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }
}

#[async_trait]
impl Authorizer for StaticTokenAuthorizer {
    async fn is_privileged(&self, principal: Option<&str>) -> bool {
        principal.is_some_and(|p| self.principals.contains(p))
    }
}

/// Authorizer that treats every caller as privileged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn is_privileged(&self, _principal: Option<&str>) -> bool {
        true
    }
}
