use crate::build::BuildEnvironment;
use crate::matrix::{FuzzTargetMatrix, RunLimits};
use crate::runner::{DEFAULT_PARSER_ENV, FuzzRunExecutor, host_cpu_count};
use crate::source::SourceRepository;
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ContainerSettings {
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_image")]
    pub image: String,
    /// Build the image from `recipe-dir` before the fuzz targets. When off, the
    /// image must already exist.
    #[serde(default = "default_build_image")]
    pub build_image: bool,
    #[serde(default = "default_recipe_dir")]
    pub recipe_dir: PathBuf,
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "spicy-fuzz".to_string()
}

fn default_build_image() -> bool {
    true
}

fn default_recipe_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            image: default_image(),
            build_image: default_build_image(),
            recipe_dir: default_recipe_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BuildSettings {
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_glue_dir")]
    pub glue_dir: PathBuf,
    #[serde(default = "default_glue_files")]
    pub glue_files: Vec<String>,
    #[serde(default = "default_glue_subdir")]
    pub glue_subdir: String,
    #[serde(default = "default_build_script")]
    pub build_script: String,
    #[serde(default = "default_cxx")]
    pub cxx: String,
    #[serde(default = "default_cc")]
    pub cc: String,
    #[serde(default = "default_sanitizer")]
    pub sanitizer: String,
    #[serde(default)]
    pub extra_env: IndexMap<String, String>,
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("spicy")
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("spicy-fuzz")
}

fn default_glue_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_glue_files() -> Vec<String> {
    ["build.sh", "Dockerfile", "fuzz.cc", "run.py", "CMakeLists.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_glue_subdir() -> String {
    "ci/fuzz".to_string()
}

fn default_build_script() -> String {
    "build.sh".to_string()
}

fn default_cxx() -> String {
    "clang++-12".to_string()
}

fn default_cc() -> String {
    "clang-12".to_string()
}

fn default_sanitizer() -> String {
    "address".to_string()
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            output_dir: default_output_dir(),
            glue_dir: default_glue_dir(),
            glue_files: default_glue_files(),
            glue_subdir: default_glue_subdir(),
            build_script: default_build_script(),
            cxx: default_cxx(),
            cc: default_cc(),
            sanitizer: default_sanitizer(),
            extra_env: IndexMap::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_total_time_secs")]
    pub max_total_time_secs: u64,
    /// Parallel fuzzing jobs per run; the host CPU count when unset.
    #[serde(default)]
    pub jobs: Option<usize>,
    #[serde(default = "default_parser_env")]
    pub parser_env: String,
    #[serde(default = "default_asan_options")]
    pub asan_options: String,
}

pub fn default_timeout_secs() -> u64 {
    120
}

pub fn default_max_total_time_secs() -> u64 {
    600
}

fn default_parser_env() -> String {
    DEFAULT_PARSER_ENV.to_string()
}

fn default_asan_options() -> String {
    "detect_leaks=0".to_string()
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_total_time_secs: default_max_total_time_secs(),
            jobs: None,
            parser_env: default_parser_env(),
            asan_options: default_asan_options(),
        }
    }
}

impl RunSettings {
    /// Limits for every run, with the job count clamped to `1..=cpu_count`.
    pub fn limits(&self) -> RunLimits {
        let cpus = host_cpu_count();
        RunLimits {
            timeout_secs: self.timeout_secs,
            max_total_time_secs: self.max_total_time_secs,
            jobs: self.jobs.unwrap_or(cpus).clamp(1, cpus),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceRepository>,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub run: RunSettings,
    pub matrix: FuzzTargetMatrix,
}

fn default_sources() -> Vec<SourceRepository> {
    vec![
        SourceRepository::new("https://github.com/zeek/spicy", "spicy"),
        SourceRepository::new(
            "https://github.com/zeek/spicy-analyzers",
            "spicy/zeek/spicy-analyzers",
        ),
    ]
}

pub fn default_matrix() -> FuzzTargetMatrix {
    let mut matrix = FuzzTargetMatrix::new();
    matrix.insert("dhcp", ["Message"]);
    matrix.insert("dns", ["Message"]);
    matrix.insert(
        "http",
        [
            "HTTP::Request",
            "HTTP::Requests",
            "HTTP::Reply",
            "HTTP::Replies",
        ],
    );
    matrix.insert(
        "ipsec",
        ["IPSecPacketUDP", "IPSecPacketsTCP", "IPSecIKE"],
    );
    matrix.insert("tftp", ["Packet"]);
    matrix.insert("pe", ["ImageFile"]);
    matrix.insert("PNG", ["File"]);
    matrix.insert("wireguard", ["WireGuardPacket"]);
    matrix
}

impl CampaignConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CampaignConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Makes every relative path absolute against `base`.
    ///
    /// Called once at startup; nothing downstream consults the process
    /// working directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = normalize(&base.join(&*p));
            }
        };
        resolve(&mut self.container.recipe_dir);
        for source in &mut self.sources {
            resolve(&mut source.path);
        }
        resolve(&mut self.build.source_dir);
        resolve(&mut self.build.output_dir);
        resolve(&mut self.build.glue_dir);
    }

    pub fn build_environment(&self) -> BuildEnvironment {
        BuildEnvironment {
            engine: self.container.engine.clone(),
            image: self.container.image.clone(),
            recipe_dir: self
                .container
                .build_image
                .then(|| self.container.recipe_dir.clone()),
            source_dir: self.build.source_dir.clone(),
            output_dir: self.build.output_dir.clone(),
            glue_dir: self.build.glue_dir.clone(),
            glue_files: self.build.glue_files.clone(),
            glue_subdir: self.build.glue_subdir.clone(),
            build_script: self.build.build_script.clone(),
            cxx: self.build.cxx.clone(),
            cc: self.build.cc.clone(),
            sanitizer: self.build.sanitizer.clone(),
            extra_env: self
                .build
                .extra_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn executor(&self) -> FuzzRunExecutor {
        let mut executor = FuzzRunExecutor::new(
            &self.container.engine,
            &self.container.image,
            &self.build.output_dir,
        );
        executor.parser_env = self.run.parser_env.clone();
        executor.asan_options = self.run.asan_options.clone();
        executor
    }
}

// Lexical cleanup of `.` components so mounts read `/base/spicy`, not `/base/./spicy`.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            container: ContainerSettings::default(),
            sources: default_sources(),
            build: BuildSettings::default(),
            run: RunSettings::default(),
            matrix: default_matrix(),
        }
    }
}
