//! Overlay packs: loading, merging, and the compile-time verb expansion
//! that rewrites author vocabulary into the canonical verb set.
//!
//! Expansion runs once, before either engine sees the module. Every emitted
//! statement carries lineage, however deeply nested.

use crate::ast::Lineage;
use crate::errors::ExpandError;
use crate::raw::{RawArgs, RawModule, RawStep};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::warn;

pub const CANONICAL_VERBS: [&str; 7] =
    ["Make", "Show", "Return", "Ask", "Choose", "Repeat", "Call"];

pub fn is_canonical(verb: &str) -> bool {
    CANONICAL_VERBS.contains(&verb)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MappedVerb {
    One(String),
    Many(Vec<String>),
}

/// One verb entry as it appears in a pack file. Keys other than the known
/// ones are mapping-supplied default arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct VerbMapping {
    #[serde(rename = "mappedVerb")]
    pub mapped_verb: MappedVerb,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub pipeline: Vec<BTreeMap<String, RawArgs>>,
    #[serde(flatten)]
    pub defaults: RawArgs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverlayPack {
    pub overlay: String,
    pub version: String,
    #[serde(default)]
    pub verbs: BTreeMap<String, VerbMapping>,
}

/// A mapping resolved against its source pack.
#[derive(Debug, Clone)]
pub struct ResolvedMapping {
    pub overlay: String,
    pub version: String,
    pub mapping: VerbMapping,
}

/// Merged raw-verb → mapping table. Core loads first; named packs override
/// per raw verb, last pack wins.
pub type OverlayMap = BTreeMap<String, ResolvedMapping>;

fn pack_path(dir: &Path, name: &str) -> std::path::PathBuf {
    dir.join(format!("verbs.{}.json", name))
}

fn read_pack(name: &str, path: &Path) -> Result<OverlayPack, ExpandError> {
    let text = std::fs::read_to_string(path).map_err(|e| ExpandError::BadPack {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&text).map_err(|e| ExpandError::BadPack {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn merge_pack(merged: &mut OverlayMap, pack: OverlayPack) {
    for (raw, mapping) in pack.verbs {
        merged.insert(
            raw,
            ResolvedMapping {
                overlay: pack.overlay.clone(),
                version: pack.version.clone(),
                mapping,
            },
        );
    }
}

/// Load the mandatory core pack plus any named packs from `dir`.
pub fn load_overlays(dir: &Path, names: &[String]) -> Result<OverlayMap, ExpandError> {
    let core = pack_path(dir, "core");
    if !core.is_file() {
        return Err(ExpandError::MissingCorePack(core.display().to_string()));
    }
    let mut merged = OverlayMap::new();
    merge_pack(&mut merged, read_pack("core", &core)?);
    for name in names {
        let path = pack_path(dir, name);
        if !path.is_file() {
            return Err(ExpandError::PackNotFound {
                name: name.clone(),
                path: path.display().to_string(),
            });
        }
        merge_pack(&mut merged, read_pack(name, &path)?);
    }
    Ok(merged)
}

#[derive(Debug, Clone, Default)]
pub struct ExpandOptions {
    pub no_unknown_verbs: bool,
    pub enforce_capabilities: bool,
    pub granted_capabilities: Vec<String>,
}

fn capability_delta(required: &[String], granted: &[String]) -> Vec<String> {
    let granted: BTreeSet<&str> = granted.iter().map(String::as_str).collect();
    required
        .iter()
        .filter(|c| !granted.contains(c.as_str()))
        .cloned()
        .collect()
}

/// Expand a whole module: flow plus every nested body.
pub fn expand_module(
    module: &RawModule,
    overlays: &OverlayMap,
    opts: &ExpandOptions,
) -> Result<(RawModule, Vec<String>), ExpandError> {
    let mut warnings = Vec::new();
    let flow = expand_steps(&module.flow, overlays, opts, &mut warnings)?;
    Ok((
        RawModule {
            name: module.name.clone(),
            inputs: module.inputs.clone(),
            flow,
            tests: module.tests.clone(),
        },
        warnings,
    ))
}

pub fn expand_steps(
    steps: &[RawStep],
    overlays: &OverlayMap,
    opts: &ExpandOptions,
    warnings: &mut Vec<String>,
) -> Result<Vec<RawStep>, ExpandError> {
    let mut out = Vec::new();
    for step in steps {
        for mut emitted in expand_one(step, overlays, opts, warnings)? {
            // Recurse into nested bodies so lineage reaches every depth.
            if let Some(branches) = emitted.branches.as_mut() {
                for branch in branches.iter_mut() {
                    branch.steps = expand_steps(&branch.steps, overlays, opts, warnings)?;
                }
            }
            if let Some(block) = emitted.block.as_mut() {
                block.steps = expand_steps(&block.steps, overlays, opts, warnings)?;
            }
            out.push(emitted);
        }
    }
    Ok(out)
}

fn expand_one(
    step: &RawStep,
    overlays: &OverlayMap,
    opts: &ExpandOptions,
    warnings: &mut Vec<String>,
) -> Result<Vec<RawStep>, ExpandError> {
    let raw = step.verb.as_str();

    let Some(resolved) = overlays.get(raw) else {
        if is_canonical(raw) {
            let mut emitted = step.clone();
            emitted.lineage = Some(Lineage::passthrough(raw));
            return Ok(vec![emitted]);
        }
        if opts.no_unknown_verbs {
            return Err(ExpandError::UnknownVerb(raw.to_string()));
        }
        warn!(verb = raw, "unknown verb, emitted unchanged");
        warnings.push(format!("Unknown verb: {}", raw));
        let mut emitted = step.clone();
        emitted.lineage = Some(Lineage::unknown(raw));
        return Ok(vec![emitted]);
    };

    let mapping = &resolved.mapping;
    let missing = capability_delta(&mapping.capabilities, &opts.granted_capabilities);
    let cap_status = if mapping.capabilities.is_empty() || missing.is_empty() {
        "pass"
    } else if opts.enforce_capabilities {
        return Err(ExpandError::Capability {
            verb: raw.to_string(),
            missing,
        });
    } else {
        warn!(verb = raw, missing = ?missing, "capability shortfall, continuing");
        warnings.push(format!(
            "Verb '{}' requires capabilities: {} (missing: {})",
            raw,
            mapping.capabilities.join(", "),
            missing.join(", ")
        ));
        "warn"
    };

    let lineage = |mapped: &str| Lineage {
        raw_verb: raw.to_string(),
        mapped_verb: Some(mapped.to_string()),
        overlay_domain: Some(resolved.overlay.clone()),
        overlay_version: Some(resolved.version.clone()),
        capability_check: cap_status.to_string(),
    };

    let check_canonical = |mapped: &str| -> Result<(), ExpandError> {
        if is_canonical(mapped) {
            Ok(())
        } else {
            Err(ExpandError::NonCanonicalTarget {
                raw: raw.to_string(),
                mapped: mapped.to_string(),
            })
        }
    };

    match &mapping.mapped_verb {
        MappedVerb::One(mapped) => {
            check_canonical(mapped)?;
            // Defaults first, author arguments win on conflict. Nested
            // bodies survive the rewrite.
            let mut args = mapping.defaults.clone();
            args.extend(step.args.clone());
            let mut emitted = step.clone();
            emitted.verb = mapped.clone();
            emitted.args = args;
            emitted.lineage = Some(lineage(mapped));
            Ok(vec![emitted])
        }
        MappedVerb::Many(stages) => {
            let mut emitted = Vec::new();
            if mapping.pipeline.is_empty() {
                for mapped in stages {
                    check_canonical(mapped)?;
                    let mut s = RawStep::new(mapped.clone());
                    s.args = step.args.clone();
                    s.lineage = Some(lineage(mapped));
                    emitted.push(s);
                }
            } else {
                for stage in &mapping.pipeline {
                    if stage.len() != 1 {
                        return Err(ExpandError::BadPipelineStage(raw.to_string()));
                    }
                    let (mapped, stage_args) = stage.iter().next().unwrap();
                    check_canonical(mapped)?;
                    let mut args = stage_args.clone();
                    args.extend(step.args.clone());
                    let mut s = RawStep::new(mapped.clone());
                    s.args = args;
                    s.lineage = Some(lineage(mapped));
                    emitted.push(s);
                }
            }
            Ok(emitted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::RawProgram;
    use std::io::Write;

    const CORE_PACK: &str = r#"{
        "overlay": "core", "version": "1.0.0",
        "verbs": {
            "set": {"mappedVerb": "Make"},
            "print": {"mappedVerb": "Show"}
        }
    }"#;

    const RESEARCH_PACK: &str = r#"{
        "overlay": "research", "version": "0.3.0",
        "verbs": {
            "Summarize": {
                "mappedVerb": ["Call", "Show"],
                "capabilities": ["net"],
                "pipeline": [
                    {"Call": {"op": "summarize.fetch"}},
                    {"Show": {}}
                ]
            },
            "print": {"mappedVerb": "Show", "style": "loud"}
        }
    }"#;

    fn write_packs(dir: &Path) {
        for (name, body) in [("core", CORE_PACK), ("research", RESEARCH_PACK)] {
            let mut f = std::fs::File::create(pack_path(dir, name)).unwrap();
            f.write_all(body.as_bytes()).unwrap();
        }
    }

    fn module_with(flow: &str) -> RawModule {
        let json = format!(
            r#"{{"modules": [{{"name": "M", "flow": {}}}]}}"#,
            flow
        );
        RawProgram::from_json(&json).unwrap().modules.remove(0)
    }

    #[test]
    fn core_pack_is_mandatory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_overlays(dir.path(), &[]),
            Err(ExpandError::MissingCorePack(_))
        ));
    }

    #[test]
    fn aliases_map_and_record_lineage() {
        let dir = tempfile::tempdir().unwrap();
        write_packs(dir.path());
        let overlays = load_overlays(dir.path(), &[]).unwrap();
        let m = module_with(r#"[{"verb": "set", "args": {"name": "x"}}]"#);
        let (expanded, warnings) = expand_module(&m, &overlays, &ExpandOptions::default()).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(expanded.flow[0].verb, "Make");
        let lineage = expanded.flow[0].lineage.as_ref().unwrap();
        assert_eq!(lineage.raw_verb, "set");
        assert_eq!(lineage.mapped_verb.as_deref(), Some("Make"));
        assert_eq!(lineage.overlay_domain.as_deref(), Some("core"));
        assert_eq!(lineage.capability_check, "pass");
    }

    #[test]
    fn later_pack_wins_per_verb() {
        let dir = tempfile::tempdir().unwrap();
        write_packs(dir.path());
        let overlays =
            load_overlays(dir.path(), &["research".to_string()]).unwrap();
        let m = module_with(r#"[{"verb": "print", "args": {}}]"#);
        let (expanded, _) = expand_module(&m, &overlays, &ExpandOptions::default()).unwrap();
        // research's "print" overrides core's and contributes a default arg
        assert_eq!(
            expanded.flow[0]
                .lineage
                .as_ref()
                .unwrap()
                .overlay_domain
                .as_deref(),
            Some("research")
        );
        assert_eq!(expanded.flow[0].args["style"], serde_json::json!("loud"));
    }

    #[test]
    fn pipeline_emits_stages_in_order_author_args_winning() {
        let dir = tempfile::tempdir().unwrap();
        write_packs(dir.path());
        let overlays = load_overlays(dir.path(), &["research".to_string()]).unwrap();
        let opts = ExpandOptions {
            granted_capabilities: vec!["net".to_string()],
            ..Default::default()
        };
        let m = module_with(r#"[{"verb": "Summarize", "args": {"op": "custom"}}]"#);
        let (expanded, warnings) = expand_module(&m, &overlays, &opts).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(expanded.flow.len(), 2);
        assert_eq!(expanded.flow[0].verb, "Call");
        assert_eq!(expanded.flow[0].args["op"], serde_json::json!("custom"));
        assert_eq!(expanded.flow[1].verb, "Show");
        for s in &expanded.flow {
            assert_eq!(s.lineage.as_ref().unwrap().raw_verb, "Summarize");
        }
    }

    #[test]
    fn capability_shortfall_warns_or_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_packs(dir.path());
        let overlays = load_overlays(dir.path(), &["research".to_string()]).unwrap();
        let m = module_with(r#"[{"verb": "Summarize", "args": {}}]"#);

        let (expanded, warnings) =
            expand_module(&m, &overlays, &ExpandOptions::default()).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(
            expanded.flow[0].lineage.as_ref().unwrap().capability_check,
            "warn"
        );

        let strict = ExpandOptions {
            enforce_capabilities: true,
            ..Default::default()
        };
        assert!(matches!(
            expand_module(&m, &overlays, &strict),
            Err(ExpandError::Capability { ref verb, .. }) if verb == "Summarize"
        ));
    }

    #[test]
    fn unknown_verb_passes_through_or_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_packs(dir.path());
        let overlays = load_overlays(dir.path(), &[]).unwrap();
        let m = module_with(r#"[{"verb": "Mystery", "args": {}}]"#);

        let (expanded, warnings) =
            expand_module(&m, &overlays, &ExpandOptions::default()).unwrap();
        assert_eq!(warnings, vec!["Unknown verb: Mystery"]);
        assert_eq!(expanded.flow[0].verb, "Mystery");
        assert!(expanded.flow[0].lineage.as_ref().unwrap().mapped_verb.is_none());

        let strict = ExpandOptions {
            no_unknown_verbs: true,
            ..Default::default()
        };
        assert!(matches!(
            expand_module(&m, &overlays, &strict),
            Err(ExpandError::UnknownVerb(ref v)) if v == "Mystery"
        ));
    }

    #[test]
    fn expansion_recurses_into_nested_bodies() {
        let dir = tempfile::tempdir().unwrap();
        write_packs(dir.path());
        let overlays = load_overlays(dir.path(), &[]).unwrap();
        let m = module_with(
            r#"[{"verb": "Choose", "branches": [
                {"when": {"type": "Boolean", "value": true},
                 "steps": [{"verb": "set", "args": {"name": "x"}}]}
            ]}]"#,
        );
        let (expanded, _) = expand_module(&m, &overlays, &ExpandOptions::default()).unwrap();
        let nested = &expanded.flow[0].branches.as_ref().unwrap()[0].steps[0];
        assert_eq!(nested.verb, "Make");
        assert_eq!(nested.lineage.as_ref().unwrap().raw_verb, "set");
    }
}
