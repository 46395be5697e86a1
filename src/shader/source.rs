//! Loading of `.slang` files: include expansion, pragma collection and stage splitting.

use super::{normalize_path, ShaderParameter, SourceProvider};
use crate::error::ShaderError;
use std::path::{Path, PathBuf};

/// A preprocessed shader file.
///
/// `body` still contains the `#pragma stage` markers; everything else the
/// dialect expresses through pragmas has been lifted into typed fields.
#[derive(Debug, Clone)]
pub struct ShaderSource {
    pub path: PathBuf,
    pub body: String,
    pub parameters: Vec<ShaderParameter>,
    pub alias: Option<String>,
    pub format: Option<String>,
}

impl ShaderSource {
    /// Fetch `path` and every file it includes.
    pub fn load(provider: &dyn SourceProvider, path: &Path) -> Result<Self, ShaderError> {
        let path = normalize_path(path);
        let mut lines = Vec::new();
        let mut stack = Vec::new();
        expand_includes(provider, &path, &mut stack, &mut lines, true)?;
        Self::from_lines(path, lines)
    }

    /// Preprocess text that is already in memory. Includes resolve through `provider`.
    pub fn from_text(provider: &dyn SourceProvider, path: &Path, text: &str) -> Result<Self, ShaderError> {
        let path = normalize_path(path);
        let mut lines = Vec::new();
        let mut stack = vec![path.clone()];
        expand_text(provider, &path, text, &mut stack, &mut lines, true)?;
        Self::from_lines(path, lines)
    }

    fn from_lines(path: PathBuf, lines: Vec<String>) -> Result<Self, ShaderError> {
        let mut body = String::new();
        let mut parameters: Vec<ShaderParameter> = Vec::new();
        let mut alias = None;
        let mut format = None;

        for line in lines {
            let trimmed = line.trim_start();
            if let Some(pragma) = trimmed.strip_prefix("#pragma") {
                let pragma = pragma.trim();
                if let Some(rest) = pragma.strip_prefix("parameter") {
                    let parameter = parse_parameter(rest).map_err(|message| ShaderError::Syntax {
                        path: path.clone(),
                        message,
                    })?;
                    if !parameters.iter().any(|p| p.name == parameter.name) {
                        parameters.push(parameter);
                    }
                    continue;
                }
                if let Some(rest) = pragma.strip_prefix("name") {
                    alias = rest.split_whitespace().next().map(str::to_string);
                    continue;
                }
                if let Some(rest) = pragma.strip_prefix("format") {
                    format = rest.split_whitespace().next().map(str::to_string);
                    continue;
                }
                if !pragma.starts_with("stage") {
                    // Unknown pragmas would trip the GLSL front end.
                    continue;
                }
            }
            body.push_str(&line);
            body.push('\n');
        }

        if !body.trim_start().starts_with("#version") {
            body.insert_str(0, "#version 450\n");
        }

        Ok(Self {
            path,
            body,
            parameters,
            alias,
            format,
        })
    }

    /// Vertex and fragment text of this file, before dialect translation.
    pub fn stages(&self) -> Result<(String, String), ShaderError> {
        split_stages(&self.body).map_err(|message| ShaderError::Syntax {
            path: self.path.clone(),
            message,
        })
    }
}

fn expand_includes(
    provider: &dyn SourceProvider,
    path: &Path,
    stack: &mut Vec<PathBuf>,
    out: &mut Vec<String>,
    root: bool,
) -> Result<(), ShaderError> {
    if stack.iter().any(|p| p == path) {
        let mut chain = stack.clone();
        chain.push(path.to_path_buf());
        return Err(ShaderError::IncludeCycle { chain });
    }

    let text = provider.read(path).map_err(|source| ShaderError::Load {
        path: path.to_path_buf(),
        source,
    })?;

    stack.push(path.to_path_buf());
    expand_text(provider, path, &text, stack, out, root)?;
    stack.pop();
    Ok(())
}

fn expand_text(
    provider: &dyn SourceProvider,
    path: &Path,
    text: &str,
    stack: &mut Vec<PathBuf>,
    out: &mut Vec<String>,
    root: bool,
) -> Result<(), ShaderError> {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("#include") {
            let target = parse_include_target(rest).ok_or_else(|| ShaderError::Syntax {
                path: path.to_path_buf(),
                message: format!("malformed include directive: {}", line.trim()),
            })?;
            let included = normalize_path(&dir.join(target));
            expand_includes(provider, &included, stack, out, false)?;
            continue;
        }
        if !root && trimmed.starts_with("#version") {
            continue;
        }
        out.push(line.to_string());
    }
    Ok(())
}

fn parse_include_target(rest: &str) -> Option<&str> {
    let rest = rest.trim();
    let inner = rest.strip_prefix('"')?;
    let end = inner.find('"')?;
    let target = &inner[..end];
    (!target.is_empty()).then_some(target)
}

/// Parse the remainder of `#pragma parameter NAME "Description" default min max [step]`.
fn parse_parameter(rest: &str) -> Result<ShaderParameter, String> {
    let rest = rest.trim();
    let (name, rest) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("incomplete parameter pragma: {rest}"))?;
    let rest = rest.trim_start();
    let (description, numbers) = match rest.strip_prefix('"') {
        Some(quoted) => {
            let end = quoted
                .find('"')
                .ok_or_else(|| format!("unterminated description for parameter {name}"))?;
            (quoted[..end].to_string(), &quoted[end + 1..])
        }
        None => (String::new(), rest),
    };

    let values = numbers
        .split_whitespace()
        .map(|v| v.trim_end_matches(['f', 'F']).parse::<f32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("bad number in parameter {name}: {e}"))?;
    if values.len() < 3 {
        return Err(format!("parameter {name} needs default, min and max"));
    }

    Ok(ShaderParameter {
        name: name.to_string(),
        description,
        default: values[0],
        min: values[1],
        max: values[2],
        step: values.get(3).copied().unwrap_or(0.0),
    })
}

/// Split dialect text at its `#pragma stage` markers.
///
/// Lines before the first marker are shared and prefixed to both stages.
pub fn split_stages(text: &str) -> Result<(String, String), String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Section {
        Shared,
        Vertex,
        Fragment,
    }

    let mut shared = String::new();
    let mut vertex = String::new();
    let mut fragment = String::new();
    let mut section = Section::Shared;
    let mut seen_vertex = false;
    let mut seen_fragment = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(stage) = trimmed
            .strip_prefix("#pragma")
            .and_then(|p| p.trim_start().strip_prefix("stage"))
        {
            section = match stage.trim() {
                "vertex" => {
                    seen_vertex = true;
                    Section::Vertex
                }
                "fragment" => {
                    seen_fragment = true;
                    Section::Fragment
                }
                other => return Err(format!("unknown shader stage {other:?}")),
            };
            continue;
        }
        let buf = match section {
            Section::Shared => &mut shared,
            Section::Vertex => &mut vertex,
            Section::Fragment => &mut fragment,
        };
        buf.push_str(line);
        buf.push('\n');
    }

    if !seen_vertex {
        return Err("missing #pragma stage vertex".to_string());
    }
    if !seen_fragment {
        return Err("missing #pragma stage fragment".to_string());
    }
    Ok((format!("{shared}{vertex}"), format!("{shared}{fragment}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::MemoryProvider;

    const MAIN: &str = r#"#version 450
#include "inc/params.inc"
#pragma name CrtPass
#pragma format R8G8B8A8_UNORM
#pragma stage vertex
void main() {}
#pragma stage fragment
void main() {}
"#;

    const PARAMS: &str = r#"#version 450
#pragma parameter SCANLINE "Scanline Strength" 0.5 0.0 1.0 0.05
#pragma parameter MASK "Mask" 0.3 0.0 1.0
#pragma parameter SCANLINE "Duplicate" 0.9 0.0 1.0 0.1
const float PI = 3.14159;
"#;

    fn provider() -> MemoryProvider {
        let mut p = MemoryProvider::new();
        p.insert("shaders/crt.slang", MAIN);
        p.insert("shaders/inc/params.inc", PARAMS);
        p
    }

    #[test]
    fn includes_are_expanded_and_pragmas_collected() {
        let source = ShaderSource::load(&provider(), Path::new("shaders/crt.slang")).unwrap();

        assert!(source.body.contains("const float PI"));
        assert_eq!(source.body.matches("#version").count(), 1);
        assert!(!source.body.contains("#pragma parameter"));
        assert_eq!(source.alias.as_deref(), Some("CrtPass"));
        assert_eq!(source.format.as_deref(), Some("R8G8B8A8_UNORM"));

        let names: Vec<_> = source.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["SCANLINE", "MASK"]);
        assert_eq!(source.parameters[0].description, "Scanline Strength");
        assert_eq!(source.parameters[0].default, 0.5);
        assert_eq!(source.parameters[0].step, 0.05);
        assert_eq!(source.parameters[1].step, 0.0);
    }

    #[test]
    fn include_cycle_is_reported_with_chain() {
        let mut p = MemoryProvider::new();
        p.insert("a.slang", "#include \"b.inc\"\n");
        p.insert("b.inc", "#include \"c.inc\"\n");
        p.insert("c.inc", "#include \"b.inc\"\n");

        match ShaderSource::load(&p, Path::new("a.slang")) {
            Err(ShaderError::IncludeCycle { chain }) => {
                assert_eq!(
                    chain,
                    vec![
                        PathBuf::from("a.slang"),
                        PathBuf::from("b.inc"),
                        PathBuf::from("c.inc"),
                        PathBuf::from("b.inc")
                    ]
                );
            }
            other => panic!("expected include cycle, got {other:?}"),
        }
    }

    #[test]
    fn diamond_includes_are_not_cycles() {
        let mut p = MemoryProvider::new();
        p.insert("a.slang", "#include \"b.inc\"\n#include \"b.inc\"\n");
        p.insert("b.inc", "// shared\n");
        let source = ShaderSource::load(&p, Path::new("a.slang")).unwrap();
        assert_eq!(source.body.matches("// shared").count(), 2);
    }

    #[test]
    fn includes_resolve_relative_to_files_above_the_working_directory() {
        let mut p = MemoryProvider::new();
        p.insert("../shaders/crt/x.slang", "#include \"../include/common.inc\"\n");
        p.insert("../shaders/include/common.inc", "// outer common\n");
        p.insert("shaders/include/common.inc", "// wrong common\n");
        let source = ShaderSource::load(&p, Path::new("../shaders/crt/x.slang")).unwrap();
        assert_eq!(source.path, PathBuf::from("../shaders/crt/x.slang"));
        assert!(source.body.contains("// outer common"));
        assert!(!source.body.contains("// wrong common"));
    }

    #[test]
    fn missing_include_is_a_load_error() {
        let mut p = MemoryProvider::new();
        p.insert("a.slang", "#include \"nope.inc\"\n");
        assert!(matches!(
            ShaderSource::load(&p, Path::new("a.slang")),
            Err(ShaderError::Load { .. })
        ));
    }

    #[test]
    fn malformed_include_is_a_syntax_error() {
        let mut p = MemoryProvider::new();
        p.insert("a.slang", "#include <system.inc>\n");
        assert!(matches!(
            ShaderSource::load(&p, Path::new("a.slang")),
            Err(ShaderError::Syntax { .. })
        ));
    }

    #[test]
    fn stages_share_the_prelude() {
        let source = ShaderSource::load(&provider(), Path::new("shaders/crt.slang")).unwrap();
        let (vertex, fragment) = source.stages().unwrap();
        assert!(vertex.starts_with("#version 450"));
        assert!(fragment.starts_with("#version 450"));
        assert!(vertex.contains("const float PI") && fragment.contains("const float PI"));
        assert_eq!(vertex.matches("void main").count(), 1);
        assert_eq!(fragment.matches("void main").count(), 1);
    }

    #[test]
    fn missing_stage_is_rejected() {
        assert!(split_stages("#version 450\n#pragma stage vertex\nvoid main() {}\n").is_err());
    }

    #[test]
    fn short_parameter_pragma_is_rejected() {
        assert!(parse_parameter("X \"desc\" 0.5 0.0").is_err());
    }
}
