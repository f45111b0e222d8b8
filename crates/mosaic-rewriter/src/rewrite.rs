use crate::compilation::{Chunk, ChunkModule, Compilation, ModuleSource};
use crate::errors::{Result, RewriteError};
use crate::probe::PackageProbe;
use mosaic_core::{ChunkManifest, manifest_file_name};
use regex::Regex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, info};

/// Sentinel require identifier bundler chunks arrive with.
pub const INTERNAL_REQUIRE: &str = "__internalRequire";

// Call sites come in two shapes: with an inline request comment and without.
static PLAIN_REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__internalRequire\(\s*(?:/\*.*?\*/\s*)?(\d+)\s*\)").unwrap());
static ASYNC_REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__internalRequire\.e\s*(?:/\*.*?\*/\s*)?\(\s*(\d+)\s*\)").unwrap());

/// Configuration surface of the rewriter.
///
/// `name` keeps several independently built plugins from colliding on one
/// page: it controls the `<name>.define(...)` wrapper, the `<name>Context`
/// helper of synthesised context modules and the `__<name>_require__`
/// identifier inside rewritten bodies.
#[derive(Debug, Clone)]
pub struct RewriterOptions {
    name: String,
}

impl Default for RewriterOptions {
    fn default() -> Self {
        Self::new("jupyter")
    }
}

impl RewriterOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn require_symbol(&self) -> String {
        format!("__{}_require__", self.name)
    }

    pub fn context_symbol(&self) -> String {
        format!("{}Context", self.name)
    }
}

/// One rewritten chunk asset plus its sidecar manifest.
#[derive(Debug, Clone)]
pub struct RewrittenChunk {
    pub file: String,
    pub source: String,
    pub manifest_file: String,
    pub manifest: ChunkManifest,
}

/// Rewrite every chunk of a finished compilation.
///
/// Replaces the bundler's numeric module addresses with versioned string
/// paths, wraps each module in a `<name>.define(...)` call and produces a
/// manifest per chunk. The module graph itself is left untouched.
pub fn rewrite_compilation(
    compilation: &Compilation,
    options: &RewriterOptions,
    probe: &mut PackageProbe,
) -> Result<Vec<RewrittenChunk>> {
    let modules_by_id: FxHashMap<u64, &ChunkModule> =
        compilation.modules().map(|module| (module.id, module)).collect();
    let mut rewriter = Rewriter {
        compilation,
        options,
        probe,
        modules_by_id,
    };
    compilation
        .chunks
        .iter()
        .map(|chunk| rewriter.rewrite_chunk(chunk))
        .collect()
}

struct Rewriter<'a> {
    compilation: &'a Compilation,
    options: &'a RewriterOptions,
    probe: &'a mut PackageProbe,
    modules_by_id: FxHashMap<u64, &'a ChunkModule>,
}

struct ModuleRewrite {
    define_path: String,
    text: String,
    requires: Vec<String>,
}

impl Rewriter<'_> {
    fn rewrite_chunk(&mut self, chunk: &Chunk) -> Result<RewrittenChunk> {
        let file = chunk
            .files
            .first()
            .cloned()
            .ok_or_else(|| RewriteError::ChunkWithoutFiles(chunk.name.clone()))?;

        let mut body = String::new();
        let mut modules = BTreeMap::new();
        let mut first_define_path = None;
        for module in &chunk.modules {
            let rewritten = self.rewrite_module(module)?;
            if first_define_path.is_none() {
                first_define_path = Some(rewritten.define_path.clone());
            }
            body.push_str(&rewritten.text);
            modules.insert(rewritten.define_path, rewritten.requires);
        }

        let manifest = ChunkManifest {
            entry: if chunk.entry { first_define_path } else { None },
            hash: chunk.hash.clone(),
            id: chunk.id.clone(),
            name: chunk.name.clone(),
            files: chunk.files.clone(),
            modules,
        };
        info!(chunk = %chunk.name, modules = chunk.modules.len(), "rewrote chunk");

        Ok(RewrittenChunk {
            manifest_file: manifest_file_name(&file),
            file,
            source: body,
            manifest,
        })
    }

    fn rewrite_module(&mut self, module: &ChunkModule) -> Result<ModuleRewrite> {
        let (body, requires) = match &module.source {
            ModuleSource::External { request } => {
                return Err(RewriteError::ExternalNotAllowed(request.clone()));
            }
            ModuleSource::Regular { text } => self.rewrite_regular(module, text)?,
            ModuleSource::Context { requests } => self.synthesize_context(module, requests)?,
        };

        let define_path = self.probe.version_path(&module.path)?.to_string();
        debug!(module = %define_path, "rewrote module");

        Ok(ModuleRewrite {
            text: wrap_define(self.options, &define_path, &body),
            define_path,
            requires,
        })
    }

    fn rewrite_regular(
        &mut self,
        module: &ChunkModule,
        text: &str,
    ) -> Result<(String, Vec<String>)> {
        let mut requires = Vec::new();

        let text = replace_numeric(&ASYNC_REQUIRE, text, |raw| {
            let id: u64 = raw
                .parse()
                .map_err(|_| RewriteError::UnresolvableAsyncChunk(raw.to_string()))?;
            let target = self
                .compilation
                .chunk_by_number(id)
                .ok_or_else(|| RewriteError::UnresolvableAsyncChunk(raw.to_string()))?;
            let file = target
                .files
                .first()
                .ok_or_else(|| RewriteError::ChunkWithoutFiles(target.name.clone()))?;
            let url = format!("{}{}", self.compilation.public_path, file);
            Ok(format!("{INTERNAL_REQUIRE}.e({})", js_string(&url)))
        })?;

        let text = replace_numeric(&PLAIN_REQUIRE, &text, |raw| {
            let id: u64 = raw
                .parse()
                .map_err(|_| RewriteError::UnknownModule(raw.to_string()))?;
            let target = self
                .modules_by_id
                .get(&id)
                .copied()
                .ok_or_else(|| RewriteError::UnknownModule(raw.to_string()))?;
            let path = self.probe.semver_path(&module.path, &target.path)?.to_string();
            if !requires.contains(&path) {
                requires.push(path.clone());
            }
            Ok(format!("{INTERNAL_REQUIRE}({})", js_string(&path)))
        })?;

        // Public-path sentinel, so cross-chunk asset URLs are self-describing.
        let text = text.replace(
            &format!("{INTERNAL_REQUIRE}.p"),
            &js_string(&self.compilation.public_path),
        );
        // The rename comes last; it also finalises the call sites above.
        let text = text.replace(INTERNAL_REQUIRE, &self.options.require_symbol());

        Ok((text, requires))
    }

    fn synthesize_context(
        &mut self,
        module: &ChunkModule,
        requests: &BTreeMap<String, u64>,
    ) -> Result<(String, Vec<String>)> {
        let mut requires = Vec::new();
        let mut entries = String::new();
        for (request, target_id) in requests {
            let target = self
                .modules_by_id
                .get(target_id)
                .copied()
                .ok_or_else(|| RewriteError::UnknownModule(target_id.to_string()))?;
            let path = self.probe.semver_path(&module.path, &target.path)?.to_string();
            entries.push_str(&format!("  {}: {},\n", js_string(request), js_string(&path)));
            if !requires.contains(&path) {
                requires.push(path);
            }
        }

        let context = self.options.context_symbol();
        let require = self.options.require_symbol();
        let body = format!(
            "var map = {{\n{entries}}};\n\
             function {context}(req) {{\n  return {require}({context}Resolve(req));\n}}\n\
             function {context}Resolve(req) {{\n  var id = map[req];\n  if (id === undefined) {{\n    throw new Error(\"Cannot find module '\" + req + \"'.\");\n  }}\n  return id;\n}}\n\
             {context}.keys = function () {{\n  return Object.keys(map);\n}};\n\
             {context}.resolve = {context}Resolve;\n\
             module.exports = {context};\n"
        );

        Ok((body, requires))
    }
}

fn wrap_define(options: &RewriterOptions, define_path: &str, body: &str) -> String {
    format!(
        "/** START DEFINE BLOCK for {define_path} **/\n\
         {name}.define({path}, function (module, exports, {require}) {{\n\
         {body}\n\
         }});\n\
         /** END DEFINE BLOCK for {define_path} **/\n",
        name = options.name(),
        path = js_string(define_path),
        require = options.require_symbol(),
    )
}

/// Apply a fallible replacement to every match of `pattern`, feeding the
/// first capture group to `replace`.
fn replace_numeric(
    pattern: &Regex,
    input: &str,
    mut replace: impl FnMut(&str) -> Result<String>,
) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for captures in pattern.captures_iter(input) {
        let call = captures.get(0).unwrap();
        out.push_str(&input[last..call.start()]);
        out.push_str(&replace(&captures[1])?);
        last = call.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Single-quoted JS string literal.
fn js_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}
