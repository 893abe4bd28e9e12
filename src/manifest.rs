//! Manifest Loader: reads a package manifest file, parsing its JSON while
//! retaining byte offsets for every key and value (`spec.md` §4.1).
//!
//! Plain `serde_json::Value` throws away span information once parsed, so
//! caret-style diagnostics need a parser that keeps the AST around. This
//! module is built on [`jsonc_parser`]'s span-preserving AST rather than
//! `serde_json`, mirroring how `denoland/deno` parses its own package
//! manifests for exactly this reason.

use std::collections::HashMap;

use color_eyre::{Result, eyre::Context};
use jsonc_parser::ast::{ObjectProp, Value};
use jsonc_parser::common::Ranged;
use jsonc_parser::{ParseOptions, parse_to_ast};

use crate::diagnostics::{Diagnostic, Location};
use crate::path::AbsFilePath;

pub const MANIFEST_FILE_NAME: &str = "package.json";

/// A string value plus the location of that value in the source (not the
/// location of its surrounding key).
#[derive(Clone, Debug)]
pub struct Spanned<T> {
    pub value: T,
    pub location: Location,
}

impl<T> Spanned<T> {
    fn new(value: T, location: Location) -> Self {
        Self { value, location }
    }
}

/// One script's raw `wireit` stanza, validated only for JSON shape — not
/// yet resolved against the rest of the graph. That resolution (dependency
/// lookups, cycle detection) is the Analyzer's job.
#[derive(Clone, Debug, Default)]
pub struct RawStanza {
    pub location: Location,
    pub command: Option<Spanned<String>>,
    pub dependencies: Vec<Spanned<String>>,
    pub dependencies_location: Option<Location>,
    pub files: Option<Vec<Spanned<String>>>,
    pub files_location: Option<Location>,
    pub output: Vec<Spanned<String>>,
    pub output_location: Option<Location>,
    pub clean: Option<Spanned<RawClean>>,
    pub package_locks: Vec<Spanned<String>>,
    pub package_locks_location: Option<Location>,
    pub service: Option<Spanned<bool>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawClean {
    Bool(bool),
    IfFileDeleted,
}

/// A parsed manifest: raw source text (kept for diagnostic rendering), the
/// top-level `scripts` mapping, and the `wireit` stanzas.
pub struct Manifest {
    pub path: AbsFilePath,
    pub source: String,
    pub scripts: HashMap<String, Spanned<String>>,
    pub wireit: HashMap<String, RawStanza>,
}

/// Either a fully parsed manifest, or a batch of diagnostics explaining why
/// it couldn't be parsed or didn't have the expected shape. Mirrors the
/// Analyzer's "never throw on a validation problem" discipline.
pub enum LoadResult {
    Loaded(Box<Manifest>),
    Invalid(Vec<Diagnostic>),
}

/// Read and parse the manifest at `path`.
///
/// IO errors (file missing, unreadable) are *Launch* errors per `spec.md`
/// §7 and are propagated as a `color_eyre::Result` error rather than a
/// diagnostic, since they occur before there is any source text to point
/// a diagnostic at. A syntactically invalid JSON body, by contrast,
/// produces a single diagnostic with a file-level location, matching the
/// spec's "malformed manifest" case.
#[tracing::instrument]
pub async fn load(path: AbsFilePath) -> Result<LoadResult> {
    let source = crate::fs::read_buffered(&path)
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("manifest not found: {path}"))?;
    let source = String::from_utf8(source).context("manifest is not valid UTF-8")?;
    Ok(parse(path, source))
}

fn parse(path: AbsFilePath, source: String) -> LoadResult {
    let parsed = match parse_to_ast(&source, &Default::default(), &ParseOptions::default()) {
        Ok(parsed) => parsed,
        Err(err) => {
            return LoadResult::Invalid(vec![Diagnostic::error(
                format!("invalid JSON: {err}"),
                Location::whole_file(path),
            )]);
        }
    };

    let Some(root) = parsed.value else {
        return LoadResult::Invalid(vec![Diagnostic::error(
            "manifest is empty",
            Location::whole_file(path),
        )]);
    };

    let mut diagnostics = Vec::new();
    let Some(root_obj) = root.as_object() else {
        return LoadResult::Invalid(vec![Diagnostic::error(
            "manifest root must be an object",
            location_of(&path, &root),
        )]);
    };

    let mut scripts = HashMap::new();
    if let Some(scripts_value) = find_prop(root_obj, "scripts") {
        if let Some(scripts_obj) = scripts_value.as_object() {
            for prop in &scripts_obj.properties {
                let Some(value) = prop.value.as_string_lit() else {
                    diagnostics.push(Diagnostic::error(
                        format!("scripts.{} must be a string", prop.name.value),
                        location_of(&path, &prop.value),
                    ));
                    continue;
                };
                scripts.insert(
                    prop.name.value.clone(),
                    Spanned::new(value.value.clone(), location_of(&path, &prop.value)),
                );
            }
        } else {
            diagnostics.push(Diagnostic::error(
                "scripts must be an object",
                location_of(&path, &scripts_value),
            ));
        }
    }

    let mut wireit = HashMap::new();
    if let Some(wireit_value) = find_prop(root_obj, "wireit") {
        let Some(wireit_obj) = wireit_value.as_object() else {
            diagnostics.push(Diagnostic::error(
                "wireit must be an object",
                location_of(&path, &wireit_value),
            ));
            return finish(path, source, scripts, wireit, diagnostics);
        };

        for prop in &wireit_obj.properties {
            match parse_stanza(&path, &prop.name.value, &prop.value) {
                Ok(stanza) => {
                    wireit.insert(prop.name.value.clone(), stanza);
                }
                Err(mut errs) => diagnostics.append(&mut errs),
            }
        }
    }

    finish(path, source, scripts, wireit, diagnostics)
}

fn finish(
    path: AbsFilePath,
    source: String,
    scripts: HashMap<String, Spanned<String>>,
    wireit: HashMap<String, RawStanza>,
    diagnostics: Vec<Diagnostic>,
) -> LoadResult {
    if diagnostics.is_empty() {
        LoadResult::Loaded(Box::new(Manifest {
            path,
            source,
            scripts,
            wireit,
        }))
    } else {
        LoadResult::Invalid(diagnostics)
    }
}

fn parse_stanza(path: &AbsFilePath, name: &str, value: &Value) -> Result<RawStanza, Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();
    let Some(obj) = value.as_object() else {
        return Err(vec![Diagnostic::error(
            format!("wireit.{name} must be an object"),
            location_of(path, value),
        )]);
    };

    let mut stanza = RawStanza {
        location: location_of(path, value),
        ..Default::default()
    };

    if let Some(command) = find_prop(obj, "command") {
        match command.as_string_lit() {
            Some(s) => stanza.command = Some(Spanned::new(s.value.clone(), location_of(path, command))),
            None => diagnostics.push(Diagnostic::error(
                format!("wireit.{name}.command must be a string"),
                location_of(path, command),
            )),
        }
    }

    if let Some(deps) = find_prop(obj, "dependencies") {
        stanza.dependencies_location = Some(location_of(path, deps));
        match parse_string_array(path, deps, &format!("wireit.{name}.dependencies")) {
            Ok(items) => stanza.dependencies = items,
            Err(mut errs) => diagnostics.append(&mut errs),
        }
    }

    if let Some(files) = find_prop(obj, "files") {
        stanza.files_location = Some(location_of(path, files));
        match parse_string_array(path, files, &format!("wireit.{name}.files")) {
            Ok(items) => stanza.files = Some(items),
            Err(mut errs) => diagnostics.append(&mut errs),
        }
    }

    if let Some(output) = find_prop(obj, "output") {
        stanza.output_location = Some(location_of(path, output));
        match parse_string_array(path, output, &format!("wireit.{name}.output")) {
            Ok(items) => stanza.output = items,
            Err(mut errs) => diagnostics.append(&mut errs),
        }
    }

    if let Some(package_locks) = find_prop(obj, "packageLocks") {
        stanza.package_locks_location = Some(location_of(path, package_locks));
        match parse_string_array(path, package_locks, &format!("wireit.{name}.packageLocks")) {
            Ok(items) => stanza.package_locks = items,
            Err(mut errs) => diagnostics.append(&mut errs),
        }
    }

    if let Some(clean) = find_prop(obj, "clean") {
        let location = location_of(path, clean);
        if let Some(b) = clean.as_boolean_lit() {
            stanza.clean = Some(Spanned::new(RawClean::Bool(b.value), location));
        } else if let Some(s) = clean.as_string_lit() {
            if s.value == "if-file-deleted" {
                stanza.clean = Some(Spanned::new(RawClean::IfFileDeleted, location));
            } else {
                diagnostics.push(Diagnostic::error(
                    format!(
                        "wireit.{name}.clean must be true, false, or \"if-file-deleted\""
                    ),
                    location,
                ));
            }
        } else {
            diagnostics.push(Diagnostic::error(
                format!(
                    "wireit.{name}.clean must be true, false, or \"if-file-deleted\""
                ),
                location,
            ));
        }
    }

    if let Some(service) = find_prop(obj, "service") {
        let location = location_of(path, service);
        match service.as_boolean_lit() {
            Some(b) => stanza.service = Some(Spanned::new(b.value, location)),
            None => diagnostics.push(Diagnostic::error(
                format!("wireit.{name}.service must be a boolean"),
                location,
            )),
        }
    }

    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }
    Ok(stanza)
}

fn parse_string_array(
    path: &AbsFilePath,
    value: &Value,
    field_label: &str,
) -> Result<Vec<Spanned<String>>, Vec<Diagnostic>> {
    let Some(array) = value.as_array() else {
        return Err(vec![Diagnostic::error(
            format!("{field_label} must be an array"),
            location_of(path, value),
        )]);
    };

    let mut items = Vec::with_capacity(array.elements.len());
    let mut diagnostics = Vec::new();
    for (index, element) in array.elements.iter().enumerate() {
        match element.as_string_lit() {
            Some(s) if !s.value.trim().is_empty() => {
                items.push(Spanned::new(s.value.clone(), location_of(path, element)));
            }
            Some(_) => diagnostics.push(Diagnostic::error(
                format!("{field_label}[{index}] must not be empty or blank"),
                location_of(path, element),
            )),
            None => diagnostics.push(Diagnostic::error(
                format!("{field_label}[{index}] must be a string"),
                location_of(path, element),
            )),
        }
    }

    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }
    Ok(items)
}

fn find_prop<'a>(
    properties: &'a jsonc_parser::ast::Object<'a>,
    name: &str,
) -> Option<&'a Value<'a>> {
    properties
        .properties
        .iter()
        .find(|p: &&ObjectProp| p.name.value == name)
        .map(|p| &p.value)
}

fn location_of(path: &AbsFilePath, value: &Value) -> Location {
    let range = value.range();
    Location::new(path.clone(), range.start, range.end.saturating_sub(range.start))
}
