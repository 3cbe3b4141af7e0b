//! External shader compiler interface
//!
//! Compilation is a black box that turns a source path into SPIR-V words or a
//! diagnostic. [`GlslcCompiler`] shells out to `glslc`; already-compiled
//! `.spv` files are read as-is.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::core::ShaderConfig;
use crate::render::error::{RenderError, RenderResult};

/// Pipeline stage of a shader module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex stage
    Vertex,
    /// Fragment stage
    Fragment,
    /// Geometry stage
    Geometry,
    /// Compute stage
    Compute,
}

impl ShaderStage {
    /// Stage name as understood by `glslc -fshader-stage`
    pub fn glslc_name(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
            Self::Geometry => "geom",
            Self::Compute => "comp",
        }
    }

    /// Infer the stage from a source extension (`.vert`, `.frag`, ...)
    pub fn from_path(path: &Path) -> Option<Self> {
        let mut path = path.to_path_buf();
        if path.extension().map_or(false, |ext| ext == "spv") {
            path.set_extension("");
        }
        match path.extension()?.to_str()? {
            "vert" => Some(Self::Vertex),
            "frag" => Some(Self::Fragment),
            "geom" => Some(Self::Geometry),
            "comp" => Some(Self::Compute),
            _ => None,
        }
    }
}

/// SPIR-V module produced by a [`ShaderCompiler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledShader {
    /// Stage
    pub stage: ShaderStage,
    /// Entry point name inside the module
    pub entry_point: String,
    /// SPIR-V words
    pub words: Arc<Vec<u32>>,
}

/// Turns shader source into SPIR-V
pub trait ShaderCompiler: Send + Sync {
    /// Compile `source` for `stage`, exporting `entry_point`
    fn compile(&self, source: &Path, stage: ShaderStage, entry_point: &str) -> RenderResult<CompiledShader>;
}

/// Compiler invoking the external `glslc` executable
#[derive(Debug, Clone)]
pub struct GlslcCompiler {
    executable: PathBuf,
    include_dirs: Vec<PathBuf>,
}

impl GlslcCompiler {
    /// Use a specific executable
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            include_dirs: Vec::new(),
        }
    }

    /// Locate `glslc`: configured path, then `$VULKAN_SDK/bin`, then `PATH`
    pub fn from_config(config: &ShaderConfig) -> Self {
        let executable = config.compiler_path.clone().unwrap_or_else(Self::default_executable);
        Self {
            executable,
            include_dirs: config.search_dirs.clone(),
        }
    }

    fn default_executable() -> PathBuf {
        let name = if cfg!(windows) { "glslc.exe" } else { "glslc" };
        if let Some(sdk) = std::env::var_os("VULKAN_SDK") {
            let candidate = PathBuf::from(sdk).join("bin").join(name);
            if candidate.exists() {
                return candidate;
            }
        }
        PathBuf::from(name)
    }

    /// Executable that will be invoked
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn read_spirv(source: &Path, stage: ShaderStage, entry_point: &str) -> RenderResult<CompiledShader> {
        let bytes = std::fs::read(source).map_err(|e| RenderError::ShaderCompilation {
            path: source.display().to_string(),
            diagnostics: e.to_string(),
        })?;
        let words = ash::util::read_spv(&mut std::io::Cursor::new(bytes)).map_err(|e| {
            RenderError::ShaderCompilation {
                path: source.display().to_string(),
                diagnostics: e.to_string(),
            }
        })?;
        Ok(CompiledShader {
            stage,
            entry_point: entry_point.to_string(),
            words: Arc::new(words),
        })
    }
}

impl ShaderCompiler for GlslcCompiler {
    fn compile(&self, source: &Path, stage: ShaderStage, entry_point: &str) -> RenderResult<CompiledShader> {
        if source.extension().map_or(false, |ext| ext == "spv") {
            return Self::read_spirv(source, stage, entry_point);
        }

        let mut command = Command::new(&self.executable);
        command.arg(format!("-fshader-stage={}", stage.glslc_name()));
        command.arg(format!("-fentry-point={}", entry_point));
        for dir in &self.include_dirs {
            let mut flag = OsString::from("-I");
            flag.push(dir.as_os_str());
            command.arg(flag);
        }
        command.arg(source).arg("-o").arg("-");

        log::debug!("Compiling {:?} ({:?}) with {:?}", source, stage, self.executable);
        let output = command.output().map_err(|e| RenderError::ShaderCompilation {
            path: source.display().to_string(),
            diagnostics: format!("failed to run {}: {}", self.executable.display(), e),
        })?;
        if !output.status.success() {
            return Err(RenderError::ShaderCompilation {
                path: source.display().to_string(),
                diagnostics: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let words = ash::util::read_spv(&mut std::io::Cursor::new(output.stdout)).map_err(|e| {
            RenderError::ShaderCompilation {
                path: source.display().to_string(),
                diagnostics: format!("glslc produced invalid SPIR-V: {}", e),
            }
        })?;
        Ok(CompiledShader {
            stage,
            entry_point: entry_point.to_string(),
            words: Arc::new(words),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_from_path() {
        assert_eq!(ShaderStage::from_path(Path::new("a/object.vert")), Some(ShaderStage::Vertex));
        assert_eq!(ShaderStage::from_path(Path::new("object.frag.spv")), Some(ShaderStage::Fragment));
        assert_eq!(ShaderStage::from_path(Path::new("object.glsl")), None);
    }

    #[test]
    fn test_precompiled_spirv_is_read() {
        let path = std::env::temp_dir().join(format!("multigpu_engine_test_{}.vert.spv", std::process::id()));
        let words: [u32; 2] = [0x0723_0203, 0x0001_0000];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        std::fs::write(&path, bytes).unwrap();

        let compiled = GlslcCompiler::new("glslc")
            .compile(&path, ShaderStage::Vertex, "main")
            .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(compiled.words.as_slice(), &words);
        assert_eq!(compiled.entry_point, "main");
    }

    #[test]
    fn test_missing_compiler_reports_diagnostics() {
        let compiler = GlslcCompiler::new("/nonexistent/glslc");
        let error = compiler
            .compile(Path::new("object.vert"), ShaderStage::Vertex, "main")
            .unwrap_err();
        assert!(matches!(error, RenderError::ShaderCompilation { .. }));
    }
}
