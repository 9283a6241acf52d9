pub mod acme_accounts;
pub mod certificate_orders;
pub mod status_page_domains;
pub mod status_pages;
