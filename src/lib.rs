//! bayflow: appointment, bay and repair-progress workflow for a car
//! dealership's service floor, served over the PostgreSQL wire protocol.

pub mod auth;
pub mod config;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod reconcile;
pub mod service;
pub mod sql;
pub mod store;
pub mod wal;
pub mod wire;
