//! Kernel descriptors and argument binding
//!
//! A [`KernelDescriptor`] is read once from kernel source when the session
//! loads its catalog: function name, version and the ordered, typed parameter
//! list. Dispatch binds arguments against that list by position (image
//! kernels) or by name (audio optional arguments) and fails fast on any
//! mismatch, before the backend sees the launch.
//!
//! ## Parameter conventions
//!
//! - first pointer parameter: input buffer; further pointers: outputs
//! - image scalars start with `(outputOffsetX, outputOffsetY, width, height)`
//! - audio scalars start with
//!   `(inputLength, chunkSize, overlapSize, samplerate, bitdepth, channels)`

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, DevicePtr};
use crate::buffer::ElementKind;
use crate::error::{MediaError, Result};

/// Scalars every image kernel receives before its free-form parameters.
pub const IMAGE_IMPLICIT_PARAMS: usize = 4;

/// Scalars every audio kernel receives before its named optional parameters.
pub const AUDIO_IMPLICIT_PARAMS: usize = 6;

/// Named optional arguments for audio kernels, e.g. `{"factor": 0.75}`
pub type OptionalArgs = BTreeMap<String, f64>;

/// Declared type of a kernel parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    Pointer(ElementKind),
    Int,
    UInt,
    Long,
    Float,
    Double,
}

impl ParamType {
    pub fn is_pointer(&self) -> bool {
        matches!(self, ParamType::Pointer(_))
    }

    fn from_scalar_type(name: &str) -> Option<Self> {
        match name {
            "int" | "short" | "char" => Some(ParamType::Int),
            "uint" | "unsigned int" | "ushort" | "uchar" | "unsigned char" => Some(ParamType::UInt),
            "long" | "ulong" | "unsigned long" | "size_t" => Some(ParamType::Long),
            "float" => Some(ParamType::Float),
            "double" => Some(ParamType::Double),
            _ => None,
        }
    }

    fn from_pointee_type(name: &str) -> Option<Self> {
        let kind = match name {
            "float" => ElementKind::Real32,
            "float2" => ElementKind::Complex32,
            "double2" => ElementKind::Complex64,
            "uchar" | "unsigned char" | "char" | "uchar4" => ElementKind::Byte,
            _ => return None,
        };
        Some(ParamType::Pointer(kind))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelParam {
    pub name: String,
    pub ty: ParamType,
}

/// Scalar argument value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    Int(i32),
    UInt(u32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl ArgValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            ArgValue::Int(v) => v as f64,
            ArgValue::UInt(v) => v as f64,
            ArgValue::Long(v) => v as f64,
            ArgValue::Float(v) => v as f64,
            ArgValue::Double(v) => v,
        }
    }

    fn as_integral(&self) -> Option<i64> {
        match *self {
            ArgValue::Int(v) => Some(v as i64),
            ArgValue::UInt(v) => Some(v as i64),
            ArgValue::Long(v) => Some(v),
            ArgValue::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(v as i64),
            ArgValue::Double(v) if v.is_finite() && v.fract() == 0.0 => Some(v as i64),
            _ => None,
        }
    }

    /// Convert to the declared parameter type.
    ///
    /// Integers convert freely when in range, floats only when integral.
    /// A `Double` never narrows into a `Float` parameter.
    pub fn coerce(&self, ty: ParamType) -> Option<ArgValue> {
        match ty {
            ParamType::Pointer(_) => None,
            ParamType::Int => self.as_integral().and_then(|v| i32::try_from(v).ok()).map(ArgValue::Int),
            ParamType::UInt => self.as_integral().and_then(|v| u32::try_from(v).ok()).map(ArgValue::UInt),
            ParamType::Long => self.as_integral().map(ArgValue::Long),
            ParamType::Float => match *self {
                ArgValue::Double(_) => None,
                other => Some(ArgValue::Float(other.as_f64() as f32)),
            },
            ParamType::Double => Some(ArgValue::Double(self.as_f64())),
        }
    }
}

/// Numeric precision variant of a kernel, chosen from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    pub fn from_kernel_name(name: &str) -> Self {
        if name.to_ascii_lowercase().contains("double") {
            Precision::Double
        } else {
            Precision::Single
        }
    }

    pub fn float_arg(&self, value: f64) -> ArgValue {
        match self {
            Precision::Single => ArgValue::Float(value as f32),
            Precision::Double => ArgValue::Double(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundScalar {
    pub name: String,
    pub value: ArgValue,
}

/// Fully bound launch arguments
#[derive(Debug, Clone)]
pub struct BoundArgs {
    pub input: Vec<DevicePtr>,
    pub input_kind: ElementKind,
    pub input_lengths: Vec<usize>,
    pub scalars: Vec<BoundScalar>,
}

impl BoundArgs {
    pub fn get(&self, name: &str) -> Option<ArgValue> {
        self.scalars.iter().find(|s| s.name == name).map(|s| s.value)
    }

    pub fn scalar_at(&self, index: usize) -> Option<ArgValue> {
        self.scalars.get(index).map(|s| s.value)
    }
}

/// Implicit leading arguments of every audio kernel
#[derive(Debug, Clone, Copy)]
pub struct AudioLaunchParams {
    pub input_length: usize,
    pub chunk_size: usize,
    pub overlap_size: usize,
    pub samplerate: u32,
    pub bitdepth: u16,
    pub channels: u16,
}

/// Static description of one compiled kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    /// Function name as declared, e.g. `mandelbrot00`
    pub name: String,
    pub base_name: String,
    pub version: String,
    pub params: Vec<KernelParam>,
    pub source: PathBuf,
}

impl KernelDescriptor {
    /// Parse the first `__kernel void name(...)` signature in `source`.
    pub fn parse_source(source: &str, path: &Path) -> Result<Self> {
        let code = strip_comments(source);
        let fail = |msg: &str| MediaError::Compile(format!("{}: {}", path.display(), msg));

        let start = code
            .find("__kernel")
            .map(|i| i + "__kernel".len())
            .or_else(|| find_keyword(&code, "kernel").map(|i| i + "kernel".len()))
            .ok_or_else(|| fail("no kernel function found"))?;
        let rest = code[start..].trim_start();
        let rest = rest
            .strip_prefix("void")
            .ok_or_else(|| fail("kernel must return void"))?;

        let open = rest.find('(').ok_or_else(|| fail("missing parameter list"))?;
        let name = rest[..open].trim().to_string();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(fail("invalid kernel name"));
        }
        let close = rest[open..].find(')').ok_or_else(|| fail("unterminated parameter list"))? + open;

        let params = rest[open + 1..close]
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty() && *p != "void")
            .map(|p| parse_param(p).ok_or_else(|| fail(&format!("unsupported parameter '{}'", p))))
            .collect::<Result<Vec<_>>>()?;

        let (base_name, version) = split_version(&name);
        Ok(Self {
            name,
            base_name,
            version,
            params,
            source: path.to_path_buf(),
        })
    }

    pub fn pointer_params(&self) -> impl Iterator<Item = &KernelParam> {
        self.params.iter().filter(|p| p.ty.is_pointer())
    }

    pub fn scalar_params(&self) -> impl Iterator<Item = &KernelParam> {
        self.params.iter().filter(|p| !p.ty.is_pointer())
    }

    /// Element kind of the input buffer parameter
    pub fn input_kind(&self) -> Option<ElementKind> {
        self.pointer_params().next().and_then(|p| match p.ty {
            ParamType::Pointer(kind) => Some(kind),
            _ => None,
        })
    }

    /// Element kind of the output buffer (second pointer, else the input's)
    pub fn output_kind(&self) -> Option<ElementKind> {
        self.pointer_params()
            .nth(1)
            .and_then(|p| match p.ty {
                ParamType::Pointer(kind) => Some(kind),
                _ => None,
            })
            .or_else(|| self.input_kind())
    }

    /// Bind `(0, 0, width, height)` plus positional variable arguments.
    pub fn bind_image_scalars(&self, width: u32, height: u32, variable: &[ArgValue]) -> Result<Vec<BoundScalar>> {
        let declared: Vec<&KernelParam> = self.scalar_params().collect();
        if declared.len() < IMAGE_IMPLICIT_PARAMS {
            return Err(MediaError::Binding(format!(
                "{} declares {} scalars, image kernels need at least {}",
                self.name,
                declared.len(),
                IMAGE_IMPLICIT_PARAMS
            )));
        }
        if declared.len() - IMAGE_IMPLICIT_PARAMS != variable.len() {
            return Err(MediaError::Binding(format!(
                "{} expects {} variable arguments, got {}",
                self.name,
                declared.len() - IMAGE_IMPLICIT_PARAMS,
                variable.len()
            )));
        }

        let implicit = [ArgValue::Int(0), ArgValue::Int(0), ArgValue::UInt(width), ArgValue::UInt(height)];
        implicit
            .iter()
            .chain(variable)
            .zip(declared)
            .map(|(value, param)| bind_one(&self.name, param, *value))
            .collect()
    }

    /// Bind the audio leading scalars plus named optional arguments.
    pub fn bind_audio_scalars(&self, launch: AudioLaunchParams, optional: &OptionalArgs) -> Result<Vec<BoundScalar>> {
        let declared: Vec<&KernelParam> = self.scalar_params().collect();
        if declared.len() < AUDIO_IMPLICIT_PARAMS {
            return Err(MediaError::Binding(format!(
                "{} declares {} scalars, audio kernels need at least {}",
                self.name,
                declared.len(),
                AUDIO_IMPLICIT_PARAMS
            )));
        }

        let implicit = [
            ArgValue::Long(launch.input_length as i64),
            ArgValue::Long(launch.chunk_size as i64),
            ArgValue::Long(launch.overlap_size as i64),
            ArgValue::UInt(launch.samplerate),
            ArgValue::UInt(launch.bitdepth as u32),
            ArgValue::UInt(launch.channels as u32),
        ];
        let mut bound = implicit
            .iter()
            .zip(&declared)
            .map(|(value, param)| bind_one(&self.name, param, *value))
            .collect::<Result<Vec<_>>>()?;

        let named = &declared[AUDIO_IMPLICIT_PARAMS..];
        if let Some(unknown) = optional.keys().find(|k| !named.iter().any(|p| &p.name == *k)) {
            return Err(MediaError::Binding(format!("{} has no parameter '{}'", self.name, unknown)));
        }

        let precision = Precision::from_kernel_name(&self.name);
        for param in named {
            let value = optional
                .get(&param.name)
                .ok_or_else(|| MediaError::Binding(format!("{} requires argument '{}'", self.name, param.name)))?;
            let value = match (param.ty, precision) {
                (ParamType::Float, Precision::Single) | (ParamType::Double, Precision::Double) => {
                    precision.float_arg(*value)
                }
                (ParamType::Float | ParamType::Double, _) => {
                    return Err(MediaError::Binding(format!(
                        "{}: {:?} precision kernel declares '{}' as {:?}",
                        self.name, precision, param.name, param.ty
                    )));
                }
                _ => ArgValue::Double(*value),
            };
            bound.push(bind_one(&self.name, param, value)?);
        }
        Ok(bound)
    }
}

fn bind_one(kernel: &str, param: &KernelParam, value: ArgValue) -> Result<BoundScalar> {
    let value = value.coerce(param.ty).ok_or_else(|| {
        MediaError::Binding(format!(
            "{}: cannot bind {:?} to parameter '{}' of type {:?}",
            kernel, value, param.name, param.ty
        ))
    })?;
    Ok(BoundScalar {
        name: param.name.clone(),
        value,
    })
}

/// Split `mandelbrot00` into `("mandelbrot", "00")`.
fn split_version(name: &str) -> (String, String) {
    let bytes = name.as_bytes();
    if bytes.len() > 2 && bytes[bytes.len() - 2..].iter().all(u8::is_ascii_digit) {
        let (base, version) = name.split_at(name.len() - 2);
        (base.to_string(), version.to_string())
    } else {
        (name.to_string(), String::new())
    }
}

fn find_keyword(code: &str, keyword: &str) -> Option<usize> {
    code.match_indices(keyword).map(|(i, _)| i).find(|&i| {
        let before = code[..i].chars().next_back();
        let after = code[i + keyword.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
            && after.is_some_and(char::is_whitespace)
    })
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '/' && chars.peek() == Some(&'/') {
            for c in chars.by_ref() {
                if c == '\n' {
                    out.push('\n');
                    break;
                }
            }
        } else if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            let mut prev = ' ';
            for c in chars.by_ref() {
                if prev == '*' && c == '/' {
                    break;
                }
                prev = c;
            }
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

const QUALIFIERS: &[&str] = &[
    "__global", "global", "__constant", "constant", "__local", "local", "__private", "private",
    "const", "restrict", "__restrict", "volatile",
];

fn parse_param(decl: &str) -> Option<KernelParam> {
    let is_pointer = decl.contains('*');
    let spaced = decl.replace('*', " ");
    let tokens: Vec<&str> = spaced
        .split_whitespace()
        .filter(|t| !QUALIFIERS.contains(t))
        .collect();
    let (name, type_tokens) = tokens.split_last()?;
    if type_tokens.is_empty() {
        return None;
    }
    let type_name = type_tokens.join(" ");
    let ty = if is_pointer {
        ParamType::from_pointee_type(&type_name)?
    } else {
        ParamType::from_scalar_type(&type_name)?
    };
    Some(KernelParam {
        name: (*name).to_string(),
        ty,
    })
}

/// Kernels compiled once per session, keyed by function name
#[derive(Debug, Default)]
pub struct KernelCatalog {
    kernels: BTreeMap<String, KernelDescriptor>,
}

impl KernelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every `*.cl` file below `dir`. Files that fail are logged and skipped.
    pub fn load_directory<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B, dir: &Path) -> Result<usize> {
        let mut paths = Vec::new();
        collect_sources(dir, &mut paths)?;
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match self.load_kernel(backend, &path) {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Skipping kernel {}: {}", path.display(), e),
            }
        }
        info!("Loaded {} kernel(s) from {}", loaded, dir.display());
        Ok(loaded)
    }

    /// Compile one kernel source and register its descriptor.
    pub fn load_kernel<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B, path: &Path) -> Result<&KernelDescriptor> {
        let descriptor = backend.compile_kernel(path)?;
        debug!("Compiled kernel {} ({} params)", descriptor.name, descriptor.params.len());
        let name = descriptor.name.clone();
        self.kernels.insert(name.clone(), descriptor);
        self.kernels
            .get(&name)
            .ok_or(MediaError::KernelNotFound(name))
    }

    /// Look up `base + version`, e.g. `("mandelbrot", "00")`.
    pub fn resolve(&self, base_name: &str, version: &str) -> Result<&KernelDescriptor> {
        let name = format!("{}{}", base_name, version);
        self.kernels.get(&name).ok_or_else(|| {
            warn!("Kernel '{}' is not loaded", name);
            MediaError::KernelNotFound(name)
        })
    }

    pub fn get(&self, name: &str) -> Option<&KernelDescriptor> {
        self.kernels.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.kernels.keys().map(String::as_str).collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &KernelDescriptor> {
        self.kernels.values()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn clear(&mut self) {
        self.kernels.clear();
    }
}

fn collect_sources(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_sources(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "cl") {
            out.push(path);
        }
    }
    Ok(())
}
