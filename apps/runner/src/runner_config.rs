use std::env;

use tessera_application::EngineConfig;
use tessera_core::{AppError, AppResult};

/// Settings of one runner invocation.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub migrate_only: bool,
    pub database_url: String,
    pub schema_path: Option<String>,
    pub db_max_connections: u32,
    pub engine: EngineConfig,
}

impl RunnerConfig {
    pub fn load() -> AppResult<Self> {
        let migrate_only = env::args().nth(1).as_deref() == Some("migrate");
        Self::from_lookup(migrate_only, |name| env::var(name).ok())
    }

    fn from_lookup(
        migrate_only: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> AppResult<Self> {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| AppError::Validation(format!("{name} is required")))
        };

        let database_url = required("DATABASE_URL")?;
        // Migrations never read the schema snapshot.
        let schema_path = if migrate_only {
            lookup("SCHEMA_PATH")
        } else {
            Some(required("SCHEMA_PATH")?)
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            default_limit: parse(&lookup, "QUERY_LIMIT_DEFAULT")?.unwrap_or(defaults.default_limit),
            max_limit: parse(&lookup, "QUERY_LIMIT_MAX")?,
            relational_batch_size: parse(&lookup, "RELATIONAL_BATCH_SIZE")?
                .unwrap_or(defaults.relational_batch_size),
            max_relational_depth: parse(&lookup, "MAX_RELATIONAL_DEPTH")?
                .unwrap_or(defaults.max_relational_depth),
            snapshot_consistency: parse_flag(&lookup, "SNAPSHOT_CONSISTENCY")?
                .unwrap_or(defaults.snapshot_consistency),
            user_collection: lookup("USER_COLLECTION")
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.user_collection),
        };
        let db_max_connections = parse(&lookup, "DB_MAX_CONNECTIONS")?.unwrap_or(10);

        if engine.default_limit == 0 {
            return Err(AppError::Validation(
                "QUERY_LIMIT_DEFAULT must be greater than zero".to_owned(),
            ));
        }

        if engine.relational_batch_size == 0 {
            return Err(AppError::Validation(
                "RELATIONAL_BATCH_SIZE must be greater than zero".to_owned(),
            ));
        }

        if db_max_connections == 0 {
            return Err(AppError::Validation(
                "DB_MAX_CONNECTIONS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            migrate_only,
            database_url,
            schema_path,
            db_max_connections,
            engine,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> AppResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|error| {
                AppError::Validation(format!("invalid {name} value '{value}': {error}"))
            })
        })
        .transpose()
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> AppResult<Option<bool>> {
    lookup(name)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(AppError::Validation(format!(
                "invalid {name} value '{value}': expected true or false"
            ))),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tessera_core::AppError;

    use super::RunnerConfig;

    fn load(migrate_only: bool, pairs: &[(&str, &str)]) -> Result<RunnerConfig, AppError> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();
        RunnerConfig::from_lookup(migrate_only, |name| values.get(name).cloned())
    }

    #[test]
    fn unset_tunables_fall_back_to_engine_defaults() {
        let config = load(
            false,
            &[("DATABASE_URL", "postgres://localhost/tessera"), ("SCHEMA_PATH", "schema.json")],
        )
        .unwrap_or_else(|_| unreachable!());

        assert_eq!(config.engine.default_limit, 100);
        assert_eq!(config.engine.max_limit, None);
        assert_eq!(config.engine.relational_batch_size, 1_000);
        assert!(!config.engine.snapshot_consistency);
        assert_eq!(config.engine.user_collection, "system_users");
        assert_eq!(config.db_max_connections, 10);
    }

    #[test]
    fn tunables_are_read_from_the_environment() {
        let config = load(
            false,
            &[
                ("DATABASE_URL", "postgres://localhost/tessera"),
                ("SCHEMA_PATH", "schema.json"),
                ("QUERY_LIMIT_DEFAULT", "25"),
                ("QUERY_LIMIT_MAX", "500"),
                ("RELATIONAL_BATCH_SIZE", "200"),
                ("MAX_RELATIONAL_DEPTH", "4"),
                ("SNAPSHOT_CONSISTENCY", "TRUE"),
                ("USER_COLLECTION", "people"),
            ],
        )
        .unwrap_or_else(|_| unreachable!());

        assert_eq!(config.engine.default_limit, 25);
        assert_eq!(config.engine.max_limit, Some(500));
        assert_eq!(config.engine.relational_batch_size, 200);
        assert_eq!(config.engine.max_relational_depth, 4);
        assert!(config.engine.snapshot_consistency);
        assert_eq!(config.engine.user_collection, "people");
    }

    #[test]
    fn malformed_values_are_validation_errors() {
        let base = [("DATABASE_URL", "postgres://localhost/tessera"), ("SCHEMA_PATH", "schema.json")];

        for invalid in [
            ("QUERY_LIMIT_DEFAULT", "many"),
            ("QUERY_LIMIT_DEFAULT", "0"),
            ("SNAPSHOT_CONSISTENCY", "sometimes"),
            ("DB_MAX_CONNECTIONS", "-1"),
        ] {
            let mut pairs = base.to_vec();
            pairs.push(invalid);
            assert!(matches!(load(false, &pairs), Err(AppError::Validation(_))));
        }
    }

    #[test]
    fn migrations_do_not_need_a_schema_snapshot() {
        let pairs = [("DATABASE_URL", "postgres://localhost/tessera")];

        assert!(load(true, &pairs).is_ok());
        assert!(matches!(load(false, &pairs), Err(AppError::Validation(_))));
    }
}
