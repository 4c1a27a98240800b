//! Default data resolution for optional analysis inputs.
//!
//! Three input files are optional in a bundle: the event catalog, the
//! return-period table and the occurrence table. When the user did not
//! supply one, the matching default is copied in from the static model data.
//! Two of the three have settings-selected variants:
//!
//! | input          | settings key          | default             | variant                   |
//! |----------------|-----------------------|---------------------|---------------------------|
//! | event catalog  | `event_set`           | `events.bin`        | `events_{variant}.bin`    |
//! | return periods | (none)                | `returnperiods.bin` | (none)                    |
//! | occurrence     | `event_occurrence_id` | `occurrence.bin`    | `occurrence{variant}.bin` |
//!
//! A user-supplied file is never overwritten. A missing static source is a
//! hard error naming the exact path: running on a silently absent input
//! produces wrong results instead of a clean failure.

use crate::error::{Result, WorkerError};
use crate::settings::ModelSettings;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Normalise a settings value for use in a data file name.
///
/// Spaces become underscores and the whole string is lowercased:
/// `"My Event Set"` → `"my_event_set"`.
pub fn format_variant(setting: &str) -> String {
    setting.replace(' ', "_").to_lowercase()
}

/// The optional inputs the resolver knows how to default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionalInput {
    EventCatalog,
    ReturnPeriods,
    Occurrence,
}

impl OptionalInput {
    /// All optional inputs in resolution order.
    pub const ALL: [OptionalInput; 3] = [
        OptionalInput::EventCatalog,
        OptionalInput::ReturnPeriods,
        OptionalInput::Occurrence,
    ];

    /// File name the computation module expects in `input/`.
    pub fn file_name(&self) -> &'static str {
        match self {
            OptionalInput::EventCatalog => "events.bin",
            OptionalInput::ReturnPeriods => "returnperiods.bin",
            OptionalInput::Occurrence => "occurrence.bin",
        }
    }

    /// Short label used in errors and logs.
    pub fn label(&self) -> &'static str {
        match self {
            OptionalInput::EventCatalog => "events",
            OptionalInput::ReturnPeriods => "return periods",
            OptionalInput::Occurrence => "occurrence",
        }
    }

    /// Name of the static data file to copy for these settings.
    pub fn source_name(&self, settings: &ModelSettings) -> String {
        match self {
            OptionalInput::EventCatalog => match settings.event_set.as_deref() {
                Some(set) => format!("events_{}.bin", format_variant(set)),
                None => self.file_name().to_string(),
            },
            OptionalInput::ReturnPeriods => self.file_name().to_string(),
            OptionalInput::Occurrence => match settings.event_occurrence_id.as_deref() {
                Some(id) => format!("occurrence{}.bin", format_variant(id)),
                None => self.file_name().to_string(),
            },
        }
    }
}

/// How one optional input ended up in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    /// The bundle already contained the file; it was left untouched.
    UserSupplied { path: PathBuf },
    /// The default was copied from the static model data.
    CopiedDefault { source: PathBuf, dest: PathBuf },
}

/// Resolution record for one optional input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedInput {
    pub input: OptionalInput,
    #[serde(flatten)]
    pub resolution: Resolution,
}

/// Fills missing optional inputs from the static model data mount.
#[derive(Debug, Clone)]
pub struct DataResolver {
    input_dir: PathBuf,
    static_dir: PathBuf,
}

impl DataResolver {
    pub fn new(input_dir: impl Into<PathBuf>, static_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            static_dir: static_dir.into(),
        }
    }

    /// Resolve every optional input, in [`OptionalInput::ALL`] order.
    pub fn resolve_all(&self, settings: &ModelSettings) -> Result<Vec<ResolvedInput>> {
        OptionalInput::ALL
            .iter()
            .map(|input| self.resolve(*input, settings))
            .collect()
    }

    /// Resolve a single optional input.
    pub fn resolve(&self, input: OptionalInput, settings: &ModelSettings) -> Result<ResolvedInput> {
        let dest = self.input_dir.join(input.file_name());
        if dest.exists() {
            info!(file = input.file_name(), "using user-supplied input");
            return Ok(ResolvedInput {
                input,
                resolution: Resolution::UserSupplied { path: dest },
            });
        }

        let source = self.static_dir.join(input.source_name(settings));
        if !source.is_file() {
            return Err(WorkerError::DataFileNotFound {
                file: input.label(),
                path: source,
            });
        }

        info!(file = input.file_name(), source = %source.display(), "using default model data file");
        copy_file(&source, &dest)?;
        Ok(ResolvedInput {
            input,
            resolution: Resolution::CopiedDefault { source, dest },
        })
    }
}

fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    std::fs::copy(source, dest).map_err(|e| {
        WorkerError::io(
            format!("copying {} to {}", source.display(), dest.display()),
            e,
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        input: PathBuf,
        static_dir: PathBuf,
    }

    fn fixture(static_files: &[&str]) -> Fixture {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input");
        let static_dir = dir.path().join("static");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&static_dir).unwrap();
        for name in static_files {
            std::fs::write(static_dir.join(name), format!("static:{name}")).unwrap();
        }
        Fixture {
            _dir: dir,
            input,
            static_dir,
        }
    }

    fn settings(event_set: Option<&str>, occurrence: Option<&str>) -> ModelSettings {
        ModelSettings {
            event_set: event_set.map(str::to_string),
            event_occurrence_id: occurrence.map(str::to_string),
        }
    }

    #[test]
    fn test_format_variant() {
        assert_eq!(format_variant("My Event Set"), "my_event_set");
        assert_eq!(format_variant("Baseline"), "baseline");
        assert_eq!(format_variant("already_ok"), "already_ok");
        assert_eq!(format_variant(" Lead Space"), "_lead_space");
    }

    #[test]
    fn test_source_names() {
        let none = settings(None, None);
        assert_eq!(OptionalInput::EventCatalog.source_name(&none), "events.bin");
        assert_eq!(OptionalInput::Occurrence.source_name(&none), "occurrence.bin");

        let variant = settings(Some("My Event Set"), Some("Long Term"));
        assert_eq!(
            OptionalInput::EventCatalog.source_name(&variant),
            "events_my_event_set.bin"
        );
        assert_eq!(
            OptionalInput::Occurrence.source_name(&variant),
            "occurrencelong_term.bin"
        );
        assert_eq!(
            OptionalInput::ReturnPeriods.source_name(&variant),
            "returnperiods.bin"
        );
    }

    #[test]
    fn test_copies_defaults_when_absent() {
        let fx = fixture(&["events.bin", "returnperiods.bin", "occurrence.bin"]);
        let resolver = DataResolver::new(&fx.input, &fx.static_dir);

        let resolved = resolver.resolve_all(&settings(None, None)).unwrap();
        assert_eq!(resolved.len(), 3);
        for r in &resolved {
            assert!(matches!(r.resolution, Resolution::CopiedDefault { .. }));
        }
        assert_eq!(
            std::fs::read_to_string(fx.input.join("events.bin")).unwrap(),
            "static:events.bin"
        );
    }

    #[test]
    fn test_copies_variant_under_canonical_name() {
        let fx = fixture(&["events_my_event_set.bin", "returnperiods.bin", "occurrence_x.bin"]);
        let resolver = DataResolver::new(&fx.input, &fx.static_dir);

        let r = resolver
            .resolve(OptionalInput::EventCatalog, &settings(Some("My Event Set"), None))
            .unwrap();
        match r.resolution {
            Resolution::CopiedDefault { source, dest } => {
                assert!(source.ends_with("events_my_event_set.bin"));
                assert!(dest.ends_with("events.bin"));
            }
            other => panic!("expected copy, got {other:?}"),
        }
        assert_eq!(
            std::fs::read_to_string(fx.input.join("events.bin")).unwrap(),
            "static:events_my_event_set.bin"
        );

        resolver
            .resolve(OptionalInput::Occurrence, &settings(None, Some("_X")))
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.input.join("occurrence.bin")).unwrap(),
            "static:occurrence_x.bin"
        );
    }

    #[test]
    fn test_never_overwrites_user_file() {
        let fx = fixture(&["events.bin", "returnperiods.bin", "occurrence.bin"]);
        std::fs::write(fx.input.join("occurrence.bin"), "user occurrence").unwrap();
        let resolver = DataResolver::new(&fx.input, &fx.static_dir);

        let resolved = resolver.resolve_all(&settings(None, Some("other"))).unwrap();
        let occ = resolved
            .iter()
            .find(|r| r.input == OptionalInput::Occurrence)
            .unwrap();
        assert!(matches!(occ.resolution, Resolution::UserSupplied { .. }));
        assert_eq!(
            std::fs::read_to_string(fx.input.join("occurrence.bin")).unwrap(),
            "user occurrence"
        );
    }

    #[test]
    fn test_missing_variant_names_exact_path() {
        let fx = fixture(&["events.bin", "returnperiods.bin", "occurrence.bin"]);
        let resolver = DataResolver::new(&fx.input, &fx.static_dir);

        let err = resolver
            .resolve(OptionalInput::EventCatalog, &settings(Some("Stochastic"), None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        match err {
            WorkerError::DataFileNotFound { file, path } => {
                assert_eq!(file, "events");
                assert_eq!(path, fx.static_dir.join("events_stochastic.bin"));
            }
            other => panic!("expected DataFileNotFound, got {other:?}"),
        }
        assert!(!fx.input.join("events.bin").exists());
    }

    #[test]
    fn test_missing_return_periods_fails() {
        let fx = fixture(&["events.bin", "occurrence.bin"]);
        let resolver = DataResolver::new(&fx.input, &fx.static_dir);
        let err = resolver.resolve_all(&settings(None, None)).unwrap_err();
        assert!(err.to_string().contains("returnperiods.bin"));
    }

    #[test]
    fn test_resolution_serializes_for_logs() {
        let r = ResolvedInput {
            input: OptionalInput::ReturnPeriods,
            resolution: Resolution::UserSupplied {
                path: PathBuf::from("input/returnperiods.bin"),
            },
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["input"], "return_periods");
        assert_eq!(v["resolution"], "user_supplied");
    }
}
