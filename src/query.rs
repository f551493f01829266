//! Read API over persisted drops.
//!
//! Shared by the CLI (`zonedrop drops`) and the JSON server. When no date
//! filter is given, the latest `drop_date` in the database is used, so the
//! default view is always "today's drops".

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;

use crate::models::{CharsetType, DropRecord};

pub const MAX_PAGE_SIZE: i64 = 200;

/// Filters for a drop listing. All fields optional; unset means "any".
#[derive(Debug, Clone, Default)]
pub struct DropFilter {
    pub tld: Option<String>,
    pub date: Option<NaiveDate>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub min_length: Option<i64>,
    pub max_length: Option<i64>,
    pub charset: Option<CharsetType>,
    /// Substring match on the label.
    pub substring: Option<String>,
    pub min_quality: Option<i64>,
    pub page: i64,
    pub page_size: i64,
}

/// One page of drops plus the total row count for the filter.
#[derive(Debug, Serialize)]
pub struct DropPage {
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub results: Vec<DropRecord>,
}

/// Query drops with filters and pagination, ordered by label.
pub async fn query_drops(pool: &SqlitePool, filter: &DropFilter) -> Result<DropPage> {
    let page = filter.page.max(1);
    let page_size = filter.page_size.clamp(1, MAX_PAGE_SIZE);

    // Default to the most recent day with data when no date bound is set.
    let date = match (filter.date, filter.date_from, filter.date_to) {
        (None, None, None) => {
            let latest: Option<String> = sqlx::query_scalar("SELECT MAX(drop_date) FROM drops")
                .fetch_one(pool)
                .await?;
            match latest.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()) {
                Some(latest) => Some(latest),
                None => {
                    return Ok(DropPage {
                        total: 0,
                        page,
                        page_size,
                        results: Vec::new(),
                    })
                }
            }
        }
        _ => filter.date,
    };

    let mut count_query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM drops WHERE 1=1");
    push_conditions(&mut count_query, filter, date);
    let total: i64 = count_query.build_query_scalar().fetch_one(pool).await?;

    let mut query = QueryBuilder::<Sqlite>::new(
        "SELECT id, label, tld, drop_date, length, label_count, charset_type, quality_score, created_at \
         FROM drops WHERE 1=1",
    );
    push_conditions(&mut query, filter, date);
    query.push(" ORDER BY label LIMIT ");
    query.push_bind(page_size);
    query.push(" OFFSET ");
    query.push_bind((page - 1) * page_size);

    let rows = query.build().fetch_all(pool).await?;
    let mut results = Vec::with_capacity(rows.len());
    for row in rows {
        let drop_date: String = row.get("drop_date");
        let charset: String = row.get("charset_type");
        results.push(DropRecord {
            id: row.get("id"),
            label: row.get("label"),
            tld: row.get("tld"),
            drop_date: NaiveDate::parse_from_str(&drop_date, "%Y-%m-%d")?,
            length: row.get("length"),
            label_count: row.get("label_count"),
            charset_type: CharsetType::from_str(&charset)
                .map_err(|e| anyhow::anyhow!(e))?,
            quality_score: row.get("quality_score"),
            created_at: row.get("created_at"),
        });
    }

    Ok(DropPage {
        total,
        page,
        page_size,
        results,
    })
}

fn push_conditions(
    query: &mut QueryBuilder<'_, Sqlite>,
    filter: &DropFilter,
    date: Option<NaiveDate>,
) {
    if let Some(tld) = &filter.tld {
        query.push(" AND tld = ");
        query.push_bind(tld.to_ascii_lowercase());
    }
    if let Some(date) = date {
        query.push(" AND drop_date = ");
        query.push_bind(date.format("%Y-%m-%d").to_string());
    }
    if let Some(from) = filter.date_from {
        query.push(" AND drop_date >= ");
        query.push_bind(from.format("%Y-%m-%d").to_string());
    }
    if let Some(to) = filter.date_to {
        query.push(" AND drop_date <= ");
        query.push_bind(to.format("%Y-%m-%d").to_string());
    }
    if let Some(min) = filter.min_length {
        query.push(" AND length >= ");
        query.push_bind(min);
    }
    if let Some(max) = filter.max_length {
        query.push(" AND length <= ");
        query.push_bind(max);
    }
    if let Some(charset) = filter.charset {
        query.push(" AND charset_type = ");
        query.push_bind(charset.as_str());
    }
    if let Some(substring) = &filter.substring {
        query.push(" AND label LIKE ");
        query.push_bind(format!("%{}%", escape_like(substring)));
        query.push(" ESCAPE '\\'");
    }
    if let Some(min_quality) = filter.min_quality {
        query.push(" AND quality_score >= ");
        query.push_bind(min_quality);
    }
}

/// Escape LIKE metacharacters in a user-supplied substring.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::detect::NewDrop;
    use crate::persist;

    fn test_config(dir: &std::path::Path) -> Config {
        let toml = format!(
            r#"[db]
path = "{0}/zonedrop.sqlite"

[storage]
data_dir = "{0}"
"#,
            dir.display()
        );
        let path = dir.join("zonedrop.toml");
        std::fs::write(&path, toml).unwrap();
        crate::config::load_config(&path).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn new_drop(label: &str, tld: &str, date: NaiveDate, quality: Option<i64>) -> NewDrop {
        NewDrop {
            label: label.to_string(),
            tld: tld.to_string(),
            drop_date: date,
            length: label.chars().count() as i64,
            label_count: 1,
            charset_type: CharsetType::classify(label),
            quality_score: quality,
        }
    }

    async fn seeded_pool(dir: &std::path::Path) -> SqlitePool {
        let config = test_config(dir);
        crate::migrate::run_migrations(&config).await.unwrap();
        let pool = crate::db::connect(&config).await.unwrap();

        let d1 = day(2025, 1, 1);
        let d2 = day(2025, 1, 2);
        let drops = vec![
            new_drop("alpha", "dev", d2, Some(70)),
            new_drop("beta", "dev", d2, Some(40)),
            new_drop("web3", "dev", d2, None),
            new_drop("co-op", "org", d2, Some(20)),
            new_drop("older", "dev", d1, Some(90)),
        ];
        persist::persist_drops(&pool, &drops, 100).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn defaults_to_latest_date() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = seeded_pool(tmp.path()).await;

        let page = query_drops(
            &pool,
            &DropFilter {
                page: 1,
                page_size: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(page.total, 4);
        assert!(page.results.iter().all(|d| d.drop_date == day(2025, 1, 2)));
    }

    #[tokio::test]
    async fn filters_compose() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = seeded_pool(tmp.path()).await;

        let page = query_drops(
            &pool,
            &DropFilter {
                tld: Some("dev".to_string()),
                date: Some(day(2025, 1, 2)),
                charset: Some(CharsetType::Letters),
                min_length: Some(4),
                page: 1,
                page_size: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let labels: Vec<&str> = page.results.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn substring_and_quality_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = seeded_pool(tmp.path()).await;

        let page = query_drops(
            &pool,
            &DropFilter {
                date: Some(day(2025, 1, 2)),
                substring: Some("lph".to_string()),
                page: 1,
                page_size: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0].label, "alpha");

        let page = query_drops(
            &pool,
            &DropFilter {
                date: Some(day(2025, 1, 2)),
                min_quality: Some(50),
                page: 1,
                page_size: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        // NULL scores never satisfy a quality threshold.
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0].label, "alpha");
    }

    #[tokio::test]
    async fn pagination_is_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = seeded_pool(tmp.path()).await;

        let first = query_drops(
            &pool,
            &DropFilter {
                date: Some(day(2025, 1, 2)),
                page: 1,
                page_size: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let second = query_drops(
            &pool,
            &DropFilter {
                date: Some(day(2025, 1, 2)),
                page: 2,
                page_size: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(first.total, 4);
        assert_eq!(first.results.len(), 2);
        assert_eq!(second.results.len(), 2);
        let mut all: Vec<String> = first
            .results
            .iter()
            .chain(second.results.iter())
            .map(|d| d.label.clone())
            .collect();
        all.dedup();
        assert_eq!(all.len(), 4, "pages must not overlap");
    }

    #[tokio::test]
    async fn empty_database_yields_empty_page() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        crate::migrate::run_migrations(&config).await.unwrap();
        let pool = crate::db::connect(&config).await.unwrap();

        let page = query_drops(
            &pool,
            &DropFilter {
                page: 1,
                page_size: 50,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page.total, 0);
        assert!(page.results.is_empty());
    }

    #[test]
    fn like_escaping() {
        assert_eq!(escape_like("a%b_c"), "a\\%b\\_c");
        assert_eq!(escape_like("plain"), "plain");
    }
}
