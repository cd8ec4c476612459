pub mod models;
pub mod runs;
pub mod status;
pub mod tenants;
