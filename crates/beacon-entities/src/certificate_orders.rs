use sea_orm::entity::prelude::*;
use async_trait::async_trait;
use sea_orm::{ActiveValue::Set, ConnectionTrait, DbErr};
use serde::{Deserialize, Serialize};
use beacon_core::DBDateTime;

/// One certificate-issuance attempt for a domain.
///
/// Terminal once `issued` or `failed`; a failed order is superseded by a
/// fresh row rather than reused. `challenge_token` and `key_authorization`
/// back the `/.well-known/acme-challenge/` endpoint (indexed for fast
/// HTTP-01 lookups).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "certificate_orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub domain_id: i32,
    pub status: String, // pending, issued, failed
    pub external_order_url: Option<String>,
    pub challenge_token: Option<String>,
    pub key_authorization: Option<String>,
    pub validation_url: Option<String>,
    pub certificate_pem: Option<String>,
    pub private_key_pem: Option<String>, // AES-GCM encrypted
    pub failure_reason: Option<String>,
    pub requested_at: DBDateTime,
    pub provisioned_at: Option<DBDateTime>,
    pub created_at: DBDateTime,
    pub updated_at: DBDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::status_page_domains::Entity",
        from = "Column::DomainId",
        to = "super::status_page_domains::Column::Id"
    )]
    Domain,
}

impl Related<super::status_page_domains::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Domain.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(mut self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let now = chrono::Utc::now();

        if insert {
            if self.created_at.is_not_set() {
                self.created_at = Set(now);
            }
            if self.updated_at.is_not_set() {
                self.updated_at = Set(now);
            }
        } else {
            self.updated_at = Set(now);
        }

        Ok(self)
    }
}
