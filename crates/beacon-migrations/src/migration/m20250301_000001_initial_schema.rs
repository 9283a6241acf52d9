use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ========================================
        // STATUS_PAGES TABLE
        // ========================================
        manager
            .create_table(
                Table::create()
                    .table(StatusPages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(StatusPages::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(StatusPages::ProjectId).integer().not_null())
                    .col(
                        ColumnDef::new(StatusPages::Name)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(StatusPages::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(StatusPages::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(StatusPages::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ========================================
        // STATUS_PAGE_DOMAINS TABLE
        // ========================================
        manager
            .create_table(
                Table::create()
                    .table(StatusPageDomains::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(StatusPageDomains::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::ProjectId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::StatusPageId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::Subdomain)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::BaseDomain)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::FullDomain)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::CnameVerified)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::SslOrdered)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::SslProvisioned)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::LastCheckedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::Version)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(StatusPageDomains::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_status_page_domains_status_page_id")
                            .from(
                                StatusPageDomains::Table,
                                StatusPageDomains::StatusPageId,
                            )
                            .to(StatusPages::Table, StatusPages::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create index on status_page_id
        manager
            .create_index(
                Index::create()
                    .name("idx_status_page_domains_page")
                    .table(StatusPageDomains::Table)
                    .col(StatusPageDomains::StatusPageId)
                    .to_owned(),
            )
            .await?;

        // Create index on the provisioning flags for the scheduler's
        // query-by-state scans
        manager
            .create_index(
                Index::create()
                    .name("idx_status_page_domains_flags")
                    .table(StatusPageDomains::Table)
                    .col(StatusPageDomains::CnameVerified)
                    .col(StatusPageDomains::SslOrdered)
                    .col(StatusPageDomains::SslProvisioned)
                    .to_owned(),
            )
            .await?;

        // full_domain must be unique among live (non-deleted) rows
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX idx_status_page_domains_full_domain \
                 ON status_page_domains (full_domain) WHERE deleted_at IS NULL",
            )
            .await?;

        // ========================================
        // CERTIFICATE_ORDERS TABLE
        // ========================================
        manager
            .create_table(
                Table::create()
                    .table(CertificateOrders::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CertificateOrders::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::DomainId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::Status)
                            .string_len(50)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::ExternalOrderUrl)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::ChallengeToken)
                            .string_len(255)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::KeyAuthorization)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::ValidationUrl)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::CertificatePem)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::PrivateKeyPem)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::FailureReason)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::RequestedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::ProvisionedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CertificateOrders::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_certificate_orders_domain_id")
                            .from(CertificateOrders::Table, CertificateOrders::DomainId)
                            .to(StatusPageDomains::Table, StatusPageDomains::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create index on challenge_token for HTTP-01 challenge serving
        manager
            .create_index(
                Index::create()
                    .name("idx_certificate_orders_token")
                    .table(CertificateOrders::Table)
                    .col(CertificateOrders::ChallengeToken)
                    .to_owned(),
            )
            .await?;

        // At most one pending order per domain
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX idx_certificate_orders_one_pending \
                 ON certificate_orders (domain_id) WHERE status = 'pending'",
            )
            .await?;

        // ========================================
        // ACME_ACCOUNTS TABLE
        // ========================================
        manager
            .create_table(
                Table::create()
                    .table(AcmeAccounts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AcmeAccounts::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AcmeAccounts::Email)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AcmeAccounts::Environment)
                            .string_len(50)
                            .not_null(),
                    )
                    .col(ColumnDef::new(AcmeAccounts::Credentials).text().not_null())
                    .col(
                        ColumnDef::new(AcmeAccounts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_acme_accounts_email_env")
                    .table(AcmeAccounts::Table)
                    .col(AcmeAccounts::Email)
                    .col(AcmeAccounts::Environment)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AcmeAccounts::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CertificateOrders::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(StatusPageDomains::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(StatusPages::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum StatusPages {
    Table,
    Id,
    ProjectId,
    Name,
    DeletedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum StatusPageDomains {
    Table,
    Id,
    ProjectId,
    StatusPageId,
    Subdomain,
    BaseDomain,
    FullDomain,
    CnameVerified,
    SslOrdered,
    SslProvisioned,
    LastCheckedAt,
    RetryCount,
    Version,
    DeletedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum CertificateOrders {
    Table,
    Id,
    DomainId,
    Status,
    ExternalOrderUrl,
    ChallengeToken,
    KeyAuthorization,
    ValidationUrl,
    CertificatePem,
    PrivateKeyPem,
    FailureReason,
    RequestedAt,
    ProvisionedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AcmeAccounts {
    Table,
    Id,
    Email,
    Environment,
    Credentials,
    CreatedAt,
}
