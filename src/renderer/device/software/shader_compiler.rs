use ash::vk;

use crate::renderer::device::{DeviceError, ShaderModule, ShaderModuleDesc};

/// The `[shader("...")]` attribute HLSL requires on ray tracing entry points.
fn stage_attribute(stage: vk::ShaderStageFlags) -> Option<&'static str> {
    match stage {
        vk::ShaderStageFlags::RAYGEN_KHR => Some("raygeneration"),
        vk::ShaderStageFlags::MISS_KHR => Some("miss"),
        vk::ShaderStageFlags::CLOSEST_HIT_KHR => Some("closesthit"),
        vk::ShaderStageFlags::ANY_HIT_KHR => Some("anyhit"),
        _ => None,
    }
}

fn strip_comments(source: &str) -> String {
    source
        .lines()
        .map(|line| line.split("//").next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Byte offset of the function named `entry`, i.e. `entry` followed by `(`.
fn find_function(source: &str, entry: &str) -> Option<usize> {
    source.match_indices(entry).map(|(ix, _)| ix).find(|&ix| {
        let before = source[..ix].chars().next_back();
        let after = source[ix + entry.len()..].trim_start().chars().next();
        matches!(before, Some(c) if c.is_whitespace()) && after == Some('(')
    })
}

/// Front end checks of the software device: the source must be structurally sound, the entry point
/// must exist and ray tracing entry points must carry the attribute of the requested stage.
pub(super) fn compile(desc: &ShaderModuleDesc<'_>) -> Result<ShaderModule, DeviceError> {
    let fail = |reason: String| DeviceError::ShaderCompilation {
        path: desc.path.display().to_string(),
        reason,
    };

    if let Some(define) = desc.defines.iter().find(|define| {
        let name = define.split('=').next().unwrap_or("");
        !is_identifier(name)
    }) {
        return Err(fail(format!("invalid define `{}`", define)));
    }

    let source = strip_comments(desc.source);
    let mut depth = 0i64;
    for c in source.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return Err(fail("unbalanced `}`".to_owned()));
        }
    }
    if depth != 0 {
        return Err(fail("unterminated block".to_owned()));
    }

    let position = find_function(&source, desc.entry)
        .ok_or_else(|| fail(format!("entry point `{}` not found", desc.entry)))?;

    if let Some(expected) = stage_attribute(desc.stage) {
        let preceding = &source[..position];
        let attribute = preceding
            .rfind("[shader(\"")
            .map(|start| &preceding[start + "[shader(\"".len()..])
            .and_then(|rest| rest.split('"').next())
            .filter(|_| {
                // the attribute has to belong to this function, not to a previous one
                let start = preceding.rfind("[shader(\"").unwrap_or(0);
                !preceding[start..].contains('}') && !preceding[start..].contains(';')
            });
        match attribute {
            Some(found) if found == expected => {}
            Some(found) => {
                return Err(fail(format!(
                    "`{}` is declared as a {} shader, expected {}",
                    desc.entry, found, expected
                )))
            }
            None => return Err(fail(format!("`{}` has no [shader(\"{}\")] attribute", desc.entry, expected))),
        }
    }

    Ok(ShaderModule {
        entry: desc.entry.to_owned(),
        stage: desc.stage,
        defines: desc.defines.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    const SOURCE: &str = r#"
        struct Payload { float3 radiance; };

        [shader("raygeneration")]
        void RayGen()
        {
            // not a closing brace }
        }

        [shader("miss")]
        void Miss(inout Payload payload) { payload.radiance = 0; }

        float4 FsMain(float2 uv : TEXCOORD0) : SV_Target { return 1; }
    "#;

    fn desc<'a>(entry: &'a str, stage: vk::ShaderStageFlags, defines: &'a [String]) -> ShaderModuleDesc<'a> {
        ShaderModuleDesc {
            path: Path::new("test.hlsl"),
            source: SOURCE,
            entry,
            stage,
            defines,
        }
    }

    #[test]
    fn resolves_entry_points_by_stage() {
        assert!(compile(&desc("RayGen", vk::ShaderStageFlags::RAYGEN_KHR, &[])).is_ok());
        assert!(compile(&desc("Miss", vk::ShaderStageFlags::MISS_KHR, &[])).is_ok());
        assert!(compile(&desc("FsMain", vk::ShaderStageFlags::FRAGMENT, &[])).is_ok());
    }

    #[test]
    fn rejects_mismatched_or_missing_entries() {
        assert!(compile(&desc("Miss", vk::ShaderStageFlags::RAYGEN_KHR, &[])).is_err());
        assert!(compile(&desc("FsMain", vk::ShaderStageFlags::CLOSEST_HIT_KHR, &[])).is_err());
        assert!(compile(&desc("ShadowMiss", vk::ShaderStageFlags::MISS_KHR, &[])).is_err());
        let defines = ["1BAD".to_owned()];
        assert!(compile(&desc("RayGen", vk::ShaderStageFlags::RAYGEN_KHR, &defines)).is_err());
    }
}
