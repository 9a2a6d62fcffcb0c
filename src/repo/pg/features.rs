use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Row};

use crate::config::SourceConfig;
use crate::domain::UnitKey;
use crate::repo::{validate_identifier, FeatureRow, FeatureStore, StoreError};

/// Reads the upstream feature relation. Column names are validated before
/// they are interpolated; values are always bound.
pub struct PgFeatureStore {
    pool: PgPool,
    relation: String,
    property_type_column: Option<String>,
}

impl PgFeatureStore {
    pub fn new(pool: PgPool, source: &SourceConfig) -> Result<Self, StoreError> {
        let relation = validate_identifier(&source.relation)?.to_string();
        let property_type_column = source
            .property_type_column
            .as_deref()
            .map(validate_identifier)
            .transpose()?
            .map(str::to_string);
        Ok(Self {
            pool,
            relation,
            property_type_column,
        })
    }

    fn select_sql(&self, column: &str, regressors: &[String]) -> Result<String, StoreError> {
        let mut sql = format!(
            "SELECT date, {}::float8 AS value",
            validate_identifier(column)?
        );
        for (i, name) in regressors.iter().enumerate() {
            sql.push_str(&format!(", {}::float8 AS r{i}", validate_identifier(name)?));
        }
        sql.push_str(&format!(" FROM {} WHERE city = $1", self.relation));
        if let Some(pt) = &self.property_type_column {
            sql.push_str(&format!(" AND {pt} IS NOT DISTINCT FROM $2"));
        }
        sql.push_str(" ORDER BY date");
        Ok(sql)
    }
}

#[async_trait]
impl FeatureStore for PgFeatureStore {
    async fn discover_units(&self) -> Result<Vec<(String, Option<String>)>, StoreError> {
        let pt = self.property_type_column.as_deref().unwrap_or("NULL");
        let sql = format!(
            "SELECT DISTINCT city, {pt}::text AS property_type FROM {} ORDER BY 1, 2",
            self.relation
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("city")?,
                    row.try_get::<Option<String>, _>("property_type")?,
                ))
            })
            .collect()
    }

    async fn fetch_rows(
        &self,
        unit: &UnitKey,
        column: &str,
        regressors: &[String],
    ) -> Result<Vec<FeatureRow>, StoreError> {
        let sql = self.select_sql(column, regressors)?;
        let mut query = sqlx::query(&sql).bind(&unit.city);
        if self.property_type_column.is_some() {
            query = query.bind(unit.property_type.as_deref());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let regressors = (0..regressors.len())
                    .map(|i| row.try_get::<Option<f64>, _>(format!("r{i}").as_str()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(FeatureRow {
                    date: row.try_get::<NaiveDate, _>("date")?,
                    value: row.try_get::<Option<f64>, _>("value")?,
                    regressors,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    fn store(source: &SourceConfig) -> Result<PgFeatureStore, StoreError> {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .map_err(StoreError::from)?;
        PgFeatureStore::new(pool, source)
    }

    #[tokio::test]
    async fn test_select_sql_binds_values_and_interpolates_columns() {
        let store = store(&SourceConfig::default()).unwrap();
        let sql = store
            .select_sql("hpi_benchmark", &["cpi_yoy_z".to_string()])
            .unwrap();
        assert_eq!(
            sql,
            "SELECT date, hpi_benchmark::float8 AS value, cpi_yoy_z::float8 AS r0 \
             FROM model_features WHERE city = $1 AND property_type IS NOT DISTINCT FROM $2 \
             ORDER BY date"
        );
    }

    #[tokio::test]
    async fn test_rejects_injected_column() {
        let store = store(&SourceConfig::default()).unwrap();
        assert!(matches!(
            store.select_sql("value; DROP TABLE x", &[]),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_invalid_relation() {
        let source = SourceConfig {
            relation: "Model Features".into(),
            ..Default::default()
        };
        assert!(store(&source).is_err());
    }
}
