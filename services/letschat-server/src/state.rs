use sqlx::PgPool;

use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub hub: Hub,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        let hub = Hub::new(pool.clone());
        Self { pool, hub }
    }
}
