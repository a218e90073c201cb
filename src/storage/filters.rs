use anyhow::Result;

use super::schema::Database;
use super::types::FilterRow;
use crate::model::FilterDef;

const FILTER_COLUMNS: &str = "id, alias, plugin, condition, props, enabled";

impl Database {
    // ========================================================================
    // Filter Operations
    // ========================================================================

    pub async fn insert_filter(&self, def: &FilterDef) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO filters (alias, plugin, condition, props, enabled)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(&def.alias)
        .bind(&def.plugin)
        .bind(&def.condition)
        .bind(def.props.to_json())
        .bind(def.enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn update_filter(&self, def: &FilterDef) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE filters SET alias = ?, plugin = ?, condition = ?, props = ?, enabled = ?
            WHERE id = ?
        "#,
        )
        .bind(&def.alias)
        .bind(&def.plugin)
        .bind(&def.condition)
        .bind(def.props.to_json())
        .bind(def.enabled)
        .bind(def.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_filter(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM filters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_filter(&self, id: i64) -> Result<Option<FilterDef>> {
        let row = sqlx::query_as::<_, FilterRow>(&format!(
            "SELECT {FILTER_COLUMNS} FROM filters WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FilterRow::into_def))
    }

    /// Filter stages in evaluation order (ascending ID)
    pub async fn list_filters(&self) -> Result<Vec<FilterDef>> {
        let rows = sqlx::query_as::<_, FilterRow>(&format!(
            "SELECT {FILTER_COLUMNS} FROM filters ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FilterRow::into_def).collect())
    }
}
