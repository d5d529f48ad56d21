//! Helper functions available inside response templates.
//!
//! `env`, `hostname`, `file` and `minify_json` write their result straight to
//! the output; handlebars turns that into a string value when they are used
//! as sub-expressions. `sum` and `glob` return typed values so they can feed
//! arithmetic and `{{#each}}` blocks.

use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, JsonValue, Output, RenderContext,
    RenderError, RenderErrorReason, ScopedJson,
};
use std::path::{Path, PathBuf};

/// Register every template function on the given registry.
pub fn register(handlebars: &mut Handlebars<'_>) {
    handlebars.register_helper("env", Box::new(env_helper));
    handlebars.register_helper("hostname", Box::new(hostname_helper));
    handlebars.register_helper("sum", Box::new(SumHelper));
    handlebars.register_helper("file", Box::new(file_helper));
    handlebars.register_helper("glob", Box::new(GlobHelper));
    handlebars.register_helper("minify_json", Box::new(minify_json_helper));
}

fn str_param<'a>(h: &'a Helper, index: usize, helper: &'static str) -> Result<&'a str, RenderError> {
    let param = h
        .param(index)
        .ok_or(RenderErrorReason::ParamNotFoundForIndex(helper, index))?;
    param
        .value()
        .as_str()
        .ok_or_else(|| RenderErrorReason::InvalidParamType("string").into())
}

fn env_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let key = str_param(h, 0, "env")?;
    out.write(&std::env::var(key).unwrap_or_default())?;
    Ok(())
}

fn hostname_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&gethostname::gethostname().to_string_lossy())?;
    Ok(())
}

fn file_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let path = str_param(h, 0, "file")?;
    let content = std::fs::read_to_string(path)
        .map_err(|e| RenderErrorReason::Other(format!("reading file {}: {}", path, e)))?;
    out.write(&content)?;
    Ok(())
}

fn minify_json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let text = str_param(h, 0, "minify_json")?;
    let minified = minify_json(text)
        .map_err(|e| RenderErrorReason::Other(format!("minifying json: {}", e)))?;
    out.write(&minified)?;
    Ok(())
}

/// `sum a b`: integer addition. Missing values count as zero.
pub struct SumHelper;

impl HelperDef for SumHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let a = int_param(h, 0)?;
        let b = int_param(h, 1)?;
        Ok(ScopedJson::Derived(JsonValue::from(a + b)))
    }
}

fn int_param(h: &Helper, index: usize) -> Result<i64, RenderError> {
    let value = h.param(index).map(|p| p.value()).unwrap_or(&JsonValue::Null);
    match value {
        JsonValue::Null => Ok(0),
        JsonValue::Number(n) => n
            .as_i64()
            .ok_or_else(|| RenderErrorReason::InvalidParamType("integer").into()),
        JsonValue::String(s) if s.is_empty() => Ok(0),
        JsonValue::String(s) => s
            .trim()
            .parse()
            .map_err(|_| RenderErrorReason::InvalidParamType("integer").into()),
        _ => Err(RenderErrorReason::InvalidParamType("integer").into()),
    }
}

/// `glob pattern`: sorted list of paths matching the pattern.
pub struct GlobHelper;

impl HelperDef for GlobHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let pattern = str_param(h, 0, "glob")?;
        let paths = glob(pattern)
            .map_err(|e| RenderErrorReason::Other(format!("glob {}: {}", pattern, e)))?;
        Ok(ScopedJson::Derived(JsonValue::from(paths)))
    }
}

/// Expand a filesystem glob with `filepath.Glob` semantics: each wildcard
/// stays within one path component, so `**` behaves like `*`. Unreadable
/// directories are skipped.
pub fn glob(pattern: &str) -> Result<Vec<String>, globset::Error> {
    let Some(meta) = pattern.find(['*', '?', '[', '{']) else {
        return Ok(if Path::new(pattern).exists() {
            vec![pattern.to_string()]
        } else {
            Vec::new()
        });
    };

    let matcher = globset::GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()?
        .compile_matcher();

    let (base, rest) = match pattern[..meta].rfind('/') {
        Some(0) => (PathBuf::from("/"), &pattern[1..]),
        Some(i) => (PathBuf::from(&pattern[..i]), &pattern[i + 1..]),
        None => (PathBuf::new(), pattern),
    };

    let mut found = Vec::new();
    walk(&base, rest.split('/').count(), &matcher, &mut found);
    found.sort();
    Ok(found)
}

/// Collect paths exactly `depth` components below `dir` that match.
fn walk(dir: &Path, depth: usize, matcher: &globset::GlobMatcher, found: &mut Vec<String>) {
    let read_from = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let Ok(entries) = std::fs::read_dir(read_from) else {
        return;
    };

    for entry in entries.flatten() {
        let path = dir.join(entry.file_name());
        if depth == 1 {
            if matcher.is_match(&path) {
                found.push(path.to_string_lossy().into_owned());
            }
        } else if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            walk(&path, depth - 1, matcher, found);
        }
    }
}

/// Validate `text` as JSON and drop insignificant whitespace. Key order,
/// number spelling and string escapes are kept exactly as written.
pub fn minify_json(text: &str) -> Result<String, serde_json::Error> {
    serde_json::from_str::<serde::de::IgnoredAny>(text)?;

    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else if ch == '"' {
            in_string = true;
            out.push(ch);
        } else if !matches!(ch, ' ' | '\t' | '\n' | '\r') {
            out.push(ch);
        }
    }
    Ok(out)
}
