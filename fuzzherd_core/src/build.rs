use crate::matrix::{FuzzTargetMatrix, binary_name};
use crate::process::{ProcessError, ProcessRunner, ProcessSpec};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Mount point of the source tree inside the build container.
pub const CONTAINER_SOURCE_DIR: &str = "/work";
/// Mount point of the output directory inside the build container.
pub const CONTAINER_OUTPUT_DIR: &str = "/out";

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Build I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Could not launch the container engine: {0}")]
    Launch(#[from] ProcessError),
    #[error("Building image '{image}' failed ({state}):\n{diagnostics}")]
    Image {
        image: String,
        state: String,
        diagnostics: String,
    },
    #[error("Fuzz target build failed ({state}):\n{diagnostics}")]
    Toolchain { state: String, diagnostics: String },
    #[error("Build finished but fuzz target {0:?} is missing")]
    MissingTarget(PathBuf),
}

impl BuildError {
    fn io(path: &Path, source: io::Error) -> Self {
        BuildError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Everything one containerized build needs. Paths are absolute.
#[derive(Debug, Clone)]
pub struct BuildEnvironment {
    pub engine: String,
    pub image: String,
    /// Directory with the image recipe; the image is built first when set.
    pub recipe_dir: Option<PathBuf>,
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Where the build glue files are copied from.
    pub glue_dir: PathBuf,
    pub glue_files: Vec<String>,
    /// Subdirectory of the source tree receiving the glue files.
    pub glue_subdir: String,
    /// Build entry point, relative to `glue_subdir`.
    pub build_script: String,
    pub cxx: String,
    pub cc: String,
    pub sanitizer: String,
    pub extra_env: Vec<(String, String)>,
}

impl BuildEnvironment {
    pub fn glue_target_dir(&self) -> PathBuf {
        self.source_dir.join(&self.glue_subdir)
    }

    /// Build script path inside the container.
    pub fn container_build_script(&self) -> String {
        format!(
            "{CONTAINER_SOURCE_DIR}/{}/{}",
            self.glue_subdir.trim_matches('/'),
            self.build_script.trim_start_matches('/')
        )
    }

    pub fn image_build_command(&self) -> Option<ProcessSpec> {
        let recipe_dir = self.recipe_dir.as_ref()?;
        Some(
            ProcessSpec::new(self.engine.as_str())
                .args(["build", "-t", self.image.as_str()])
                .arg(recipe_dir.to_string_lossy()),
        )
    }

    pub fn toolchain_command(&self) -> ProcessSpec {
        let mut spec = ProcessSpec::new(self.engine.as_str())
            .args(["run", "--rm", "--privileged"])
            .arg("-v")
            .arg(format!(
                "{}:{CONTAINER_OUTPUT_DIR}",
                self.output_dir.display()
            ))
            .arg("-e")
            .arg(format!("OUT={CONTAINER_OUTPUT_DIR}"))
            .arg("-v")
            .arg(format!(
                "{}:{CONTAINER_SOURCE_DIR}",
                self.source_dir.display()
            ))
            .arg("-e")
            .arg(format!("CXX={}", self.cxx))
            .arg("-e")
            .arg(format!("CC={}", self.cc))
            .arg("-e")
            .arg(format!("SANITIZER={}", self.sanitizer));
        for (key, value) in &self.extra_env {
            spec = spec.arg("-e").arg(format!("{key}={value}"));
        }
        spec.arg(self.image.as_str())
            .arg(self.container_build_script())
    }
}

/// Drives the one-shot containerized build of all fuzz targets.
#[derive(Debug, Clone)]
pub struct BuildDriver {
    env: BuildEnvironment,
}

impl BuildDriver {
    pub fn new(env: BuildEnvironment) -> Self {
        Self { env }
    }

    pub fn environment(&self) -> &BuildEnvironment {
        &self.env
    }

    /// Prepares the tree, builds the image if configured and runs the toolchain.
    ///
    /// Any error here means no fuzz target may run.
    pub fn build(&self, runner: &mut dyn ProcessRunner) -> Result<(), BuildError> {
        self.ensure_output_dir()?;
        self.install_glue()?;
        register_subdirectory(&self.env.source_dir, &self.env.glue_subdir)?;

        if let Some(spec) = self.env.image_build_command() {
            info!(image = %self.env.image, "building container image");
            let output = runner.run(&spec)?;
            if !output.state.is_success() {
                return Err(BuildError::Image {
                    image: self.env.image.clone(),
                    state: output.state.to_string(),
                    diagnostics: output.diagnostics(),
                });
            }
        }

        info!(
            image = %self.env.image,
            sanitizer = %self.env.sanitizer,
            output = ?self.env.output_dir,
            "building fuzz targets"
        );
        let output = runner.run(&self.env.toolchain_command())?;
        if !output.state.is_success() {
            return Err(BuildError::Toolchain {
                state: output.state.to_string(),
                diagnostics: output.diagnostics(),
            });
        }
        info!(elapsed = ?output.duration, "fuzz targets built");
        Ok(())
    }

    pub fn ensure_output_dir(&self) -> Result<(), BuildError> {
        fs::create_dir_all(&self.env.output_dir)
            .map_err(|e| BuildError::io(&self.env.output_dir, e))
    }

    /// Copies the glue files into the source tree, overwriting stale copies.
    pub fn install_glue(&self) -> Result<(), BuildError> {
        let target_dir = self.env.glue_target_dir();
        fs::create_dir_all(&target_dir).map_err(|e| BuildError::io(&target_dir, e))?;
        for name in &self.env.glue_files {
            let from = self.env.glue_dir.join(name);
            let to = target_dir.join(name);
            debug!(from = ?from, to = ?to, "installing build glue");
            fs::copy(&from, &to).map_err(|e| BuildError::io(&from, e))?;
        }
        Ok(())
    }

    /// Fails if any grammar in `matrix` has no binary in the output directory.
    pub fn verify_targets(&self, matrix: &FuzzTargetMatrix) -> Result<(), BuildError> {
        for grammar in matrix.grammars() {
            if matrix.parsers(grammar).is_some_and(<[String]>::is_empty) {
                continue;
            }
            let binary = self.env.output_dir.join(binary_name(grammar));
            if !binary.is_file() {
                return Err(BuildError::MissingTarget(binary));
            }
        }
        Ok(())
    }
}

/// Adds `add_subdirectory(<subdir>)` to the tree's top-level CMakeLists.txt
/// unless a line with exactly that directive is already present.
///
/// Returns whether the file was changed.
pub fn register_subdirectory(source_dir: &Path, subdir: &str) -> Result<bool, BuildError> {
    let cmakelists = source_dir.join("CMakeLists.txt");
    let directive = format!("add_subdirectory({})", subdir.trim_matches('/'));
    let mut content =
        fs::read_to_string(&cmakelists).map_err(|e| BuildError::io(&cmakelists, e))?;

    if content.lines().any(|line| line.trim() == directive) {
        debug!(path = ?cmakelists, "build subdirectory already registered");
        return Ok(false);
    }

    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&directive);
    content.push('\n');
    fs::write(&cmakelists, content).map_err(|e| BuildError::io(&cmakelists, e))?;
    info!(path = ?cmakelists, %directive, "registered build subdirectory");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeRunner;
    use crate::process::{ExitState, ProcessOutput};
    use tempfile::TempDir;

    const GLUE: [&str; 5] = ["build.sh", "Dockerfile", "fuzz.cc", "run.py", "CMakeLists.txt"];

    struct Layout {
        _root: TempDir,
        env: BuildEnvironment,
    }

    fn layout() -> Layout {
        let root = tempfile::tempdir().unwrap();
        let glue_dir = root.path().join("glue");
        let source_dir = root.path().join("spicy");
        fs::create_dir_all(&glue_dir).unwrap();
        fs::create_dir_all(&source_dir).unwrap();
        for name in GLUE {
            fs::write(glue_dir.join(name), format!("# {name}\n")).unwrap();
        }
        fs::write(source_dir.join("CMakeLists.txt"), "project(spicy)\n").unwrap();

        let env = BuildEnvironment {
            engine: "docker".to_string(),
            image: "spicy-fuzz".to_string(),
            recipe_dir: None,
            output_dir: root.path().join("spicy-fuzz"),
            source_dir,
            glue_dir,
            glue_files: GLUE.iter().map(|s| s.to_string()).collect(),
            glue_subdir: "ci/fuzz".to_string(),
            build_script: "build.sh".to_string(),
            cxx: "clang++-12".to_string(),
            cc: "clang-12".to_string(),
            sanitizer: "address".to_string(),
            extra_env: Vec::new(),
        };
        Layout { _root: root, env }
    }

    #[test]
    fn build_prepares_tree_and_runs_toolchain_once() {
        let layout = layout();
        let driver = BuildDriver::new(layout.env.clone());
        let mut runner = FakeRunner::succeeding();

        driver.build(&mut runner).unwrap();

        assert!(layout.env.output_dir.is_dir());
        for name in GLUE {
            let installed = layout.env.source_dir.join("ci/fuzz").join(name);
            assert_eq!(fs::read_to_string(installed).unwrap(), format!("# {name}\n"));
        }
        assert_eq!(runner.calls.len(), 1);
        let expected = format!(
            "docker run --rm --privileged -v {out}:/out -e OUT=/out -v {src}:/work \
             -e CXX=clang++-12 -e CC=clang-12 -e SANITIZER=address spicy-fuzz /work/ci/fuzz/build.sh",
            out = layout.env.output_dir.display(),
            src = layout.env.source_dir.display(),
        );
        assert_eq!(runner.command_lines(), vec![expected]);
    }

    #[test]
    fn image_is_built_before_toolchain_when_recipe_given() {
        let mut layout = layout();
        layout.env.recipe_dir = Some(layout.env.glue_dir.clone());
        let driver = BuildDriver::new(layout.env.clone());
        let mut runner = FakeRunner::succeeding();

        driver.build(&mut runner).unwrap();
        assert_eq!(runner.calls.len(), 2);
        assert_eq!(
            runner.command_lines()[0],
            format!("docker build -t spicy-fuzz {}", layout.env.glue_dir.display())
        );
        assert_eq!(runner.calls[1].args[0], "run");
    }

    #[test]
    fn failed_image_build_stops_before_toolchain() {
        let mut layout = layout();
        layout.env.recipe_dir = Some(layout.env.glue_dir.clone());
        let driver = BuildDriver::new(layout.env.clone());
        let mut runner = FakeRunner::new(|_| Ok(ProcessOutput::with_state(ExitState::Code(1))));

        assert!(matches!(
            driver.build(&mut runner),
            Err(BuildError::Image { .. })
        ));
        assert_eq!(runner.calls.len(), 1);
    }

    #[test]
    fn toolchain_failure_keeps_diagnostics_verbatim() {
        let layout = layout();
        let driver = BuildDriver::new(layout.env.clone());
        let mut runner = FakeRunner::new(|_| {
            Ok(ProcessOutput {
                state: ExitState::Code(2),
                stderr_tail: vec![
                    "fuzz.cc:12:5: error: use of undeclared identifier 'x'".to_string(),
                    "ninja: build stopped: subcommand failed.".to_string(),
                ],
                duration: Default::default(),
            })
        });

        match driver.build(&mut runner) {
            Err(BuildError::Toolchain { state, diagnostics }) => {
                assert_eq!(state, "exited with code 2");
                assert_eq!(
                    diagnostics,
                    "fuzz.cc:12:5: error: use of undeclared identifier 'x'\n\
                     ninja: build stopped: subcommand failed."
                );
            }
            other => panic!("Expected toolchain error, got {other:?}"),
        }
    }

    #[test]
    fn extra_env_is_forwarded_before_image() {
        let mut layout = layout();
        layout.env.extra_env = vec![("CFLAGS".to_string(), "-O1".to_string())];
        let args = layout.env.toolchain_command().args;
        let image_pos = args.iter().position(|a| a == "spicy-fuzz").unwrap();
        let env_pos = args.iter().position(|a| a == "CFLAGS=-O1").unwrap();
        assert!(env_pos < image_pos);
        assert_eq!(args[env_pos - 1], "-e");
    }

    #[test]
    fn existing_output_dir_is_tolerated() {
        let layout = layout();
        fs::create_dir_all(&layout.env.output_dir).unwrap();
        let driver = BuildDriver::new(layout.env.clone());
        driver.ensure_output_dir().unwrap();
        driver.ensure_output_dir().unwrap();
    }

    #[test]
    fn glue_install_overwrites_stale_copies() {
        let layout = layout();
        let driver = BuildDriver::new(layout.env.clone());
        driver.install_glue().unwrap();
        fs::write(layout.env.glue_dir.join("fuzz.cc"), "// new\n").unwrap();
        driver.install_glue().unwrap();
        assert_eq!(
            fs::read_to_string(layout.env.glue_target_dir().join("fuzz.cc")).unwrap(),
            "// new\n"
        );
    }

    #[test]
    fn missing_glue_file_is_an_io_error() {
        let layout = layout();
        fs::remove_file(layout.env.glue_dir.join("run.py")).unwrap();
        let driver = BuildDriver::new(layout.env.clone());
        let mut runner = FakeRunner::succeeding();
        assert!(matches!(
            driver.build(&mut runner),
            Err(BuildError::Io { .. })
        ));
        assert!(runner.calls.is_empty());
    }

    #[test]
    fn subdirectory_registered_exactly_once() {
        let layout = layout();
        let src = &layout.env.source_dir;
        assert!(register_subdirectory(src, "ci/fuzz").unwrap());
        assert!(!register_subdirectory(src, "ci/fuzz").unwrap());
        assert!(!register_subdirectory(src, "ci/fuzz/").unwrap());

        let content = fs::read_to_string(src.join("CMakeLists.txt")).unwrap();
        assert_eq!(content, "project(spicy)\nadd_subdirectory(ci/fuzz)\n");
    }

    #[test]
    fn directive_starts_on_its_own_line() {
        let layout = layout();
        let src = &layout.env.source_dir;
        fs::write(src.join("CMakeLists.txt"), "project(spicy)").unwrap();
        register_subdirectory(src, "ci/fuzz").unwrap();
        assert_eq!(
            fs::read_to_string(src.join("CMakeLists.txt")).unwrap(),
            "project(spicy)\nadd_subdirectory(ci/fuzz)\n"
        );
    }

    #[test]
    fn repeated_builds_do_not_duplicate_registration() {
        let layout = layout();
        let driver = BuildDriver::new(layout.env.clone());
        let mut runner = FakeRunner::succeeding();
        driver.build(&mut runner).unwrap();
        driver.build(&mut runner).unwrap();

        let content = fs::read_to_string(layout.env.source_dir.join("CMakeLists.txt")).unwrap();
        assert_eq!(content.matches("add_subdirectory(ci/fuzz)").count(), 1);
    }

    #[test]
    fn verify_targets_requires_one_binary_per_grammar() {
        let layout = layout();
        let driver = BuildDriver::new(layout.env.clone());
        driver.ensure_output_dir().unwrap();
        let mut matrix = FuzzTargetMatrix::new();
        matrix.insert("dhcp", ["Message"]);
        matrix.insert("dns", ["Message"]);
        matrix.insert("tftp", Vec::<String>::new());

        fs::write(layout.env.output_dir.join("fuzz-dhcp"), b"").unwrap();
        match driver.verify_targets(&matrix) {
            Err(BuildError::MissingTarget(path)) => assert!(path.ends_with("fuzz-dns")),
            other => panic!("Expected missing target, got {other:?}"),
        }

        fs::write(layout.env.output_dir.join("fuzz-dns"), b"").unwrap();
        driver.verify_targets(&matrix).unwrap();
    }
}
