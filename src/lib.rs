pub mod authentication;
pub mod configuration;
pub mod domain;
pub mod fetch;
pub mod ingest;
pub mod metrics;
pub mod outbox;
pub mod parsers;
pub mod parsing;
pub mod publishing;
pub mod read_model;
pub mod routes;
pub mod startup;
pub mod storage;
pub mod telemetry;
pub mod tenant;
pub mod utils;
pub mod worker;
