pub mod api;
pub mod dispatcher;

pub use dispatcher::{Dispatcher, ScopeFn};

use anyhow::Result;
use std::sync::Arc;

use crate::storage::Storage;

pub async fn start<S: Storage>(port: u16, dispatcher: Arc<Dispatcher<S>>) -> Result<()> {
    api::start(port, dispatcher).await
}
