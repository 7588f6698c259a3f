use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::Config;
use crate::engagement::Engagement;

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Config,
    pub engagement: Engagement,
}

impl AppState {
    pub fn new(db: DbPool, config: Config) -> Self {
        let engagement = Engagement::new(db.clone(), config.limits);
        Self {
            db,
            config,
            engagement,
        }
    }
}
