pub mod archive;
pub mod billing_db;
pub mod budget;
pub mod claims;
pub mod config;
pub mod consumer;
pub mod contracts;
pub mod dlq;
pub mod fabric;
pub mod handlers;
pub mod models;
pub mod notify;
pub mod olap;
pub mod pricing;
pub mod router;
pub mod stream;
pub mod usage_worker;

use std::sync::Arc;

use consumer::StreamConsumer;
use dlq::DlqManager;
use fabric::AnalyticsFabric;

#[derive(Clone)]
pub struct AppState {
    pub consumer: Arc<StreamConsumer>,
    pub fabric: Arc<AnalyticsFabric>,
    pub dlq: Arc<DlqManager>,
}
