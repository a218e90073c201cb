use anyhow::Result;

use super::schema::Database;
use super::types::OutputRow;
use crate::model::OutputDef;

const OUTPUT_COLUMNS: &str =
    "id, alias, plugin, condition, props, enabled, success_count, error_count";

impl Database {
    // ========================================================================
    // Output Operations
    // ========================================================================

    /// Insert a new output definition. The `id` and counters of `def` are
    /// ignored; returns the assigned ID.
    pub async fn insert_output(&self, def: &OutputDef) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO outputs (alias, plugin, condition, props, enabled)
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

    /// Update the configuration of an output, leaving its counters alone.
    pub async fn update_output(&self, def: &OutputDef) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outputs SET alias = ?, plugin = ?, condition = ?, props = ?, enabled = ?
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

    pub async fn delete_output(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM outputs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_output(&self, id: i64) -> Result<Option<OutputDef>> {
        let row = sqlx::query_as::<_, OutputRow>(&format!(
            "SELECT {OUTPUT_COLUMNS} FROM outputs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(OutputRow::into_def))
    }

    pub async fn list_outputs(&self) -> Result<Vec<OutputDef>> {
        let rows = sqlx::query_as::<_, OutputRow>(&format!(
            "SELECT {OUTPUT_COLUMNS} FROM outputs ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(OutputRow::into_def).collect())
    }

    /// Overwrite the delivery counters of an output.
    pub async fn update_output_counters(&self, id: i64, success: u64, errors: u64) -> Result<()> {
        sqlx::query("UPDATE outputs SET success_count = ?, error_count = ? WHERE id = ?")
            .bind(success as i64)
            .bind(errors as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
