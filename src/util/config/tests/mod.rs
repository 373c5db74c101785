//! Config 单元测试
//!
//! 测试 TOML 解析、环境变量覆盖与校验规则

use std::io::Write;

use crate::runtime::guid::ProviderKind;
use crate::runtime::memory::AllocatorKind;
use crate::runtime::scheduler::SchedulingStrategy;
use crate::util::config::{ConfigError, RuntimeConfig, ENV_DOMAINS, ENV_LOG, ENV_WORKERS};
use crate::util::logger::LogLevel;

fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
    move |name| {
        pairs
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    }
}

#[cfg(test)]
mod parse_tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.runtime.domains, 1);
        assert_eq!(config.guid.provider, ProviderKind::Counted);
        assert_eq!(config.comm.reorder_window, 1);
    }

    #[test]
    fn test_all_sections() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [runtime]
            domains = 3

            [guid]
            provider = "labeled"
            max_entries = 4096

            [scheduler]
            workers = 2
            strategy = "priority"

            [allocator]
            kind = "bounded"
            capacity_bytes = 65536

            [comm]
            sequenced = true
            reorder_window = 4

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime.domains, 3);
        assert_eq!(config.guid.provider, ProviderKind::Labeled);
        assert_eq!(config.guid.max_entries, 4096);
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.strategy, SchedulingStrategy::Priority);
        assert_eq!(config.allocator.kind, AllocatorKind::Bounded);
        assert!(config.comm.sequenced);
        assert_eq!(config.comm.reorder_window, 4);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_value_is_parse_error() {
        let err = RuntimeConfig::from_toml_str("[guid]\nprovider = \"magic\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_to_toml_reparses() {
        let mut config = RuntimeConfig::default();
        config.runtime.domains = 2;
        config.scheduler.workers = 3;
        let text = config.to_toml().unwrap();
        assert_eq!(RuntimeConfig::from_toml_str(&text).unwrap(), config);
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\nworkers = 5\n").unwrap();
        let config = RuntimeConfig::load_file(file.path()).unwrap();
        assert_eq!(config.scheduler.workers, 5);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuntimeConfig::load_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowrt.toml");
        let mut config = RuntimeConfig::default();
        config.comm.sequenced = true;
        config.save(&path).unwrap();
        assert_eq!(RuntimeConfig::load_file(&path).unwrap(), config);
    }
}

#[cfg(test)]
mod env_tests {
    use super::*;

    #[test]
    fn test_overrides_apply() {
        let mut config = RuntimeConfig::default();
        config
            .apply_env(env(&[(ENV_WORKERS, "7"), (ENV_DOMAINS, " 2 "), (ENV_LOG, "WARN")]))
            .unwrap();
        assert_eq!(config.scheduler.workers, 7);
        assert_eq!(config.runtime.domains, 2);
        assert_eq!(config.log.level, LogLevel::Warn);
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = RuntimeConfig::default();
        let err = config.apply_env(env(&[(ENV_WORKERS, "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: ENV_WORKERS, .. }));
    }
}

#[cfg(test)]
mod validate_tests {
    use super::*;

    #[test]
    fn test_ptr_provider_single_domain_only() {
        let mut config = RuntimeConfig::default();
        config.guid.provider = ProviderKind::Ptr;
        assert!(config.validate().is_ok());
        config.runtime.domains = 2;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_limits() {
        let mut config = RuntimeConfig::default();
        config.runtime.domains = 0;
        assert!(config.validate().is_err());
        config.runtime.domains = 128;
        assert!(config.validate().is_err());
        config.runtime.domains = 127;
        assert!(config.validate().is_ok());
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());
    }
}
