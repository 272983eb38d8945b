use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_MAX_CONCURRENT_FETCHES;
use crate::error::HarvestError;

pub const CONFIG_FILE: &str = "harvest.json";
pub const DEFAULT_PORTAL_API_URL: &str = "https://api.data.igvf.org";
pub const DEFAULT_PORTAL_UI_URL: &str = "https://data.igvf.org";
pub const DEFAULT_WORKSPACE_NAMESPACE: &str = "anvil-datastorage";
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 120;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub portal_api_url: Option<String>,
    #[serde(default)]
    pub portal_ui_url: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub manifest_bucket: Option<String>,
    #[serde(default)]
    pub max_concurrent_fetches: Option<usize>,
    #[serde(default)]
    pub poll_interval_seconds: Option<u64>,
    #[serde(default)]
    pub profiles: Vec<ProfileEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ProfileEntry {
    /// One of [`KNOWN_PROFILES`], such as `HMB-MDS` or `MOUSE`.
    Shorthand(String),
    Detailed(ProfileEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ProfileEntryObject {
    pub name: String,
    #[serde(default)]
    pub initial_files_query: Option<String>,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub destination_bucket: Option<String>,
    #[serde(default)]
    pub workspace_namespace: Option<String>,
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub overwrite_tables: Option<bool>,
    #[serde(default)]
    pub preload_searches: Option<Vec<String>>,
}

/// Everything one harvest-and-transfer run needs to know about its selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileConfig {
    pub name: String,
    pub initial_files_query: String,
    pub job_name: String,
    pub destination_bucket: Option<String>,
    pub workspace_namespace: String,
    pub workspace_name: Option<String>,
    pub overwrite_tables: bool,
    pub preload_searches: Vec<String>,
}

impl ProfileConfig {
    pub fn destination_bucket(&self) -> Result<&str, HarvestError> {
        self.destination_bucket
            .as_deref()
            .ok_or_else(|| self.incomplete("destination_bucket"))
    }

    pub fn workspace_name(&self) -> Result<&str, HarvestError> {
        self.workspace_name
            .as_deref()
            .ok_or_else(|| self.incomplete("workspace_name"))
    }

    /// File name prefix of the exported tables: `igvf-anvil-hmb` -> `igvf_anvil_hmb`.
    pub fn table_prefix(&self) -> String {
        self.job_name.replace('-', "_")
    }

    fn incomplete(&self, field: &str) -> HarvestError {
        HarvestError::IncompleteProfile {
            profile: self.name.clone(),
            field: field.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub portal_api_url: String,
    pub portal_ui_url: String,
    pub project_id: Option<String>,
    pub manifest_bucket: Option<String>,
    pub max_concurrent_fetches: usize,
    pub poll_interval: Duration,
    pub profiles: Vec<ProfileConfig>,
}

impl ResolvedConfig {
    pub fn profile(&self, name: &str) -> Result<&ProfileConfig, HarvestError> {
        self.profiles
            .iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| HarvestError::UnknownProfile(name.to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => default_config_path().ok_or(HarvestError::MissingConfig)?,
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let profiles = config
            .profiles
            .into_iter()
            .map(|entry| match entry {
                ProfileEntry::Shorthand(code) => shorthand_profile(&code),
                ProfileEntry::Detailed(obj) => detailed_profile(obj),
            })
            .collect::<Result<Vec<_>, HarvestError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            portal_api_url: config
                .portal_api_url
                .unwrap_or_else(|| DEFAULT_PORTAL_API_URL.to_string()),
            portal_ui_url: config
                .portal_ui_url
                .unwrap_or_else(|| DEFAULT_PORTAL_UI_URL.to_string()),
            project_id: config.project_id,
            manifest_bucket: config.manifest_bucket,
            max_concurrent_fetches: config
                .max_concurrent_fetches
                .unwrap_or(DEFAULT_MAX_CONCURRENT_FETCHES),
            poll_interval: Duration::from_secs(
                config
                    .poll_interval_seconds
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECONDS),
            ),
            profiles,
        })
    }
}

/// `./harvest.json`, falling back to the per-user config directory.
fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    ProjectDirs::from("org", "igvf", "portal-harvester")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
        .filter(|path| path.exists())
}

fn validate_code(code: &str) -> Result<String, HarvestError> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return Err(HarvestError::ConfigParse("empty profile name".to_string()));
    }
    Ok(trimmed.to_string())
}

pub fn data_use_files_query(code: &str) -> String {
    format!(
        "/search/?type=File&file_set.data_use_limitation_summaries={}&status=released&frame=object&limit=all",
        code.replace(' ', "+")
    )
}

pub fn data_use_file_sets_query(code: &str) -> String {
    format!(
        "/search/?type=FileSet&data_use_limitation_summaries={}&status=released&limit=all&frame=object",
        code.replace(' ', "+")
    )
}

pub fn default_job_name(code: &str) -> String {
    format!("igvf-anvil-{}", code.to_lowercase().replace(' ', "-"))
}

const MOUSE_FILES_QUERY: &str = concat!(
    "/search/?type=File",
    "&lab.title!=Charles+Gersbach%2C+Duke",
    "&file_set.samples.taxa=Mus+musculus",
    "&status=released&frame=object&limit=all",
);

const MOUSE_FILE_SETS_QUERY: &str = concat!(
    "/search/?type=FileSet",
    "&donors.taxa=Mus+musculus",
    "&lab.title!=Charles+Gersbach%2C+Duke",
    "&status=released&limit=all&frame=object",
);

const HUMAN_FILES_QUERY: &str = concat!(
    "/search/?type=File",
    "&file_set.samples.taxa=Homo+sapiens",
    "&file_set.data_use_limitation_summaries=No+limitations",
    "&file_set.data_use_limitation_summaries=no+certificate",
    "&lab.title=Lea+Starita%2C+UW",
    "&lab.title=Doug+Fowler%2C+UW",
    "&lab.title=Thomas+Quertermous%2C+Stanford",
    "&lab.title=Karen+Mohlke%2C+UNC",
    "&lab.title=Ryan+Corces%2C+Gladstone+Institute+UCSF",
    "&lab.title=Ansuman+Satpathy%2C+Stanford",
    "&lab.title=Jason+Buenrostro%2C+Broad",
    "&lab.title=Jay+Shendure%2C+UW",
    "&status=released&frame=object&limit=all",
);

const HUMAN_FILE_SETS_QUERY: &str = concat!(
    "/search/?type=FileSet",
    "&donors.taxa=Homo+sapiens",
    "&data_use_limitation_summaries=No+limitations",
    "&data_use_limitation_summaries=no+certificate",
    "&status=released&limit=all&frame=object",
);

#[derive(Debug, Clone, Copy)]
enum Selection {
    /// Files whose file set carries the profile code as its data use limitation.
    DataUse,
    Fixed {
        files_query: &'static str,
        file_sets_query: &'static str,
    },
}

/// A profile the shorthand form can name.
#[derive(Debug, Clone, Copy)]
pub struct KnownProfile {
    pub code: &'static str,
    pub job_name: &'static str,
    selection: Selection,
}

impl KnownProfile {
    const fn data_use(code: &'static str, job_name: &'static str) -> Self {
        Self {
            code,
            job_name,
            selection: Selection::DataUse,
        }
    }

    pub fn lookup(code: &str) -> Option<&'static KnownProfile> {
        KNOWN_PROFILES
            .iter()
            .find(|profile| profile.code.eq_ignore_ascii_case(code))
    }

    pub fn files_query(&self) -> String {
        match self.selection {
            Selection::DataUse => data_use_files_query(self.code),
            Selection::Fixed { files_query, .. } => files_query.to_string(),
        }
    }

    pub fn file_sets_query(&self) -> String {
        match self.selection {
            Selection::DataUse => data_use_file_sets_query(self.code),
            Selection::Fixed {
                file_sets_query, ..
            } => file_sets_query.to_string(),
        }
    }
}

pub const KNOWN_PROFILES: &[KnownProfile] = &[
    KnownProfile::data_use("HMB-MDS", "igvf-anvil-hmb-mds"),
    KnownProfile::data_use("GRU", "igvf-anvil-gru"),
    KnownProfile::data_use("HMB", "igvf-anvil-hmb"),
    KnownProfile::data_use("GRU-PUB", "igvf-anvil-gru-pub"),
    KnownProfile::data_use("GRU-PUB-NPU", "igvf-anvil-gru-pub-npu"),
    KnownProfile {
        code: "MOUSE",
        job_name: "igvf-mouse",
        selection: Selection::Fixed {
            files_query: MOUSE_FILES_QUERY,
            file_sets_query: MOUSE_FILE_SETS_QUERY,
        },
    },
    KnownProfile {
        code: "HUMAN",
        job_name: "igvf-human",
        selection: Selection::Fixed {
            files_query: HUMAN_FILES_QUERY,
            file_sets_query: HUMAN_FILE_SETS_QUERY,
        },
    },
];

fn shorthand_profile(code: &str) -> Result<ProfileConfig, HarvestError> {
    let code = validate_code(code)?;
    let known = KnownProfile::lookup(&code).ok_or_else(|| {
        let codes: Vec<&str> = KNOWN_PROFILES.iter().map(|profile| profile.code).collect();
        HarvestError::ConfigParse(format!(
            "unknown profile code {code}; expected one of {}",
            codes.join(", ")
        ))
    })?;
    Ok(ProfileConfig {
        name: known.code.to_string(),
        initial_files_query: known.files_query(),
        job_name: known.job_name.to_string(),
        destination_bucket: None,
        workspace_namespace: DEFAULT_WORKSPACE_NAMESPACE.to_string(),
        workspace_name: None,
        overwrite_tables: false,
        preload_searches: vec![known.file_sets_query()],
    })
}

/// Unset fields fall back to the known profile of the same name, or to the
/// data use queries for the name when there is none.
fn detailed_profile(obj: ProfileEntryObject) -> Result<ProfileConfig, HarvestError> {
    let name = validate_code(&obj.name)?;
    let known = KnownProfile::lookup(&name);
    Ok(ProfileConfig {
        initial_files_query: obj.initial_files_query.unwrap_or_else(|| match known {
            Some(known) => known.files_query(),
            None => data_use_files_query(&name),
        }),
        job_name: obj.job_name.unwrap_or_else(|| match known {
            Some(known) => known.job_name.to_string(),
            None => default_job_name(&name),
        }),
        destination_bucket: obj.destination_bucket,
        workspace_namespace: obj
            .workspace_namespace
            .unwrap_or_else(|| DEFAULT_WORKSPACE_NAMESPACE.to_string()),
        workspace_name: obj.workspace_name,
        overwrite_tables: obj.overwrite_tables.unwrap_or(false),
        preload_searches: obj.preload_searches.unwrap_or_else(|| match known {
            Some(known) => vec![known.file_sets_query()],
            None => vec![data_use_file_sets_query(&name)],
        }),
        name,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_config_shorthand() {
        let config = Config {
            schema_version: None,
            portal_api_url: None,
            portal_ui_url: None,
            project_id: None,
            manifest_bucket: None,
            max_concurrent_fetches: None,
            poll_interval_seconds: None,
            profiles: vec![ProfileEntry::Shorthand("HMB-MDS".to_string())],
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.portal_api_url, DEFAULT_PORTAL_API_URL);
        assert_eq!(resolved.max_concurrent_fetches, DEFAULT_MAX_CONCURRENT_FETCHES);
        let profile = resolved.profile("hmb-mds").unwrap();
        assert_eq!(profile.job_name, "igvf-anvil-hmb-mds");
        assert_eq!(profile.table_prefix(), "igvf_anvil_hmb_mds");
        assert!(
            profile
                .initial_files_query
                .contains("file_set.data_use_limitation_summaries=HMB-MDS")
        );
        assert_matches!(
            profile.destination_bucket(),
            Err(HarvestError::IncompleteProfile { .. })
        );
        assert_matches!(resolved.profile("GRU"), Err(HarvestError::UnknownProfile(_)));
    }
}
