use sqlx::PgPool;

use crate::DEFAULT_DATABASE_URL;

pub async fn get_test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.into());
    let pool = PgPool::connect(&url).await.unwrap();
    crate::setup(&pool).await.unwrap();
    pool
}

pub async fn cleanup(pool: &PgPool) {
    sqlx::query("TRUNCATE rings, ring_entities, ring_members, ring_subscribers")
        .execute(pool)
        .await
        .unwrap();
}
