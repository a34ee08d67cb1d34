//! Per-tenant suppression list

use relaycast_common::types::{SuppressionType, TenantId};
use relaycast_common::{Error, Result};
use relaycast_storage::models::{CreateSuppression, Suppression};
use relaycast_storage::repository::SuppressionRepository;
use std::collections::HashSet;
use tracing::info;

use crate::db_error;

/// Canonical form of a phone number or email address.
///
/// Emails are trimmed and lower-cased. Phone numbers keep a leading `+` and
/// their digits only.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    if trimmed.contains('@') {
        return trimmed.to_lowercase();
    }

    let looks_like_phone = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')' | '.'));
    if looks_like_phone && trimmed.chars().any(|c| c.is_ascii_digit()) {
        let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
        if trimmed.starts_with('+') {
            format!("+{}", digits)
        } else {
            digits
        }
    } else {
        trimmed.to_lowercase()
    }
}

/// Addresses that must not be messaged
#[derive(Clone)]
pub struct SuppressionList {
    repo: SuppressionRepository,
}

impl SuppressionList {
    pub fn new(repo: SuppressionRepository) -> Self {
        Self { repo }
    }

    pub async fn is_suppressed(&self, tenant_id: TenantId, address: &str) -> Result<bool> {
        self.repo
            .exists(tenant_id, &normalize_address(address))
            .await
            .map_err(db_error)
    }

    /// Add an address; adding it again updates type and reason
    pub async fn add(
        &self,
        tenant_id: TenantId,
        address: &str,
        suppression_type: SuppressionType,
        reason: Option<String>,
    ) -> Result<Suppression> {
        let address = normalize_address(address);
        if address.is_empty() {
            return Err(Error::Validation("address must not be empty".into()));
        }

        let entry = self
            .repo
            .upsert(CreateSuppression {
                tenant_id,
                address,
                suppression_type,
                reason,
            })
            .await
            .map_err(db_error)?;
        info!(
            tenant_id = %tenant_id,
            address = %entry.address,
            suppression_type = %suppression_type,
            "Address suppressed"
        );
        Ok(entry)
    }

    pub async fn remove(&self, tenant_id: TenantId, address: &str) -> Result<()> {
        if self
            .repo
            .delete(tenant_id, &normalize_address(address))
            .await
            .map_err(db_error)?
        {
            Ok(())
        } else {
            Err(Error::NotFound(format!("{} is not suppressed", address)))
        }
    }

    pub async fn list(&self, tenant_id: TenantId, limit: i64, offset: i64) -> Result<Vec<Suppression>> {
        self.repo
            .list_by_tenant(tenant_id, limit, offset)
            .await
            .map_err(db_error)
    }

    /// The subset of `addresses` that is suppressed, in input order
    pub async fn filter_suppressed(&self, tenant_id: TenantId, addresses: &[String]) -> Result<Vec<String>> {
        let normalized: Vec<String> = addresses.iter().map(|a| normalize_address(a)).collect();
        let found: HashSet<String> = self
            .repo
            .find_existing(tenant_id, &normalized)
            .await
            .map_err(db_error)?
            .into_iter()
            .collect();

        Ok(addresses
            .iter()
            .zip(normalized)
            .filter(|(_, n)| found.contains(n))
            .map(|(a, _)| a.clone())
            .collect())
    }
}
