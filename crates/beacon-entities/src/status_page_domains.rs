use sea_orm::entity::prelude::*;
use async_trait::async_trait;
use sea_orm::{ActiveValue::Set, ConnectionTrait, DbErr};
use serde::{Deserialize, Serialize};
use beacon_core::DBDateTime;

/// A custom hostname bound to a status page.
///
/// The three provisioning flags are never written directly; every change
/// goes through the domain state machine so that illegal combinations
/// (e.g. `ssl_ordered` without `cname_verified`) cannot be persisted.
/// `version` is the optimistic-lock token for those transitions.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "status_page_domains")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub project_id: i32,
    pub status_page_id: i32,
    pub subdomain: String,
    pub base_domain: String,
    pub full_domain: String,
    pub cname_verified: bool,
    pub ssl_ordered: bool,
    pub ssl_provisioned: bool,
    pub last_checked_at: Option<DBDateTime>,
    pub retry_count: i32,
    pub version: i32,
    pub deleted_at: Option<DBDateTime>,
    pub created_at: DBDateTime,
    pub updated_at: DBDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::status_pages::Entity",
        from = "Column::StatusPageId",
        to = "super::status_pages::Column::Id"
    )]
    StatusPage,
    #[sea_orm(has_many = "super::certificate_orders::Entity")]
    CertificateOrders,
}

impl Related<super::status_pages::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StatusPage.def()
    }
}

impl Related<super::certificate_orders::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CertificateOrders.def()
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
