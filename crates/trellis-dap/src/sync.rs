//! Breakpoint synchronization: per-source full lists for `setBreakpoints`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use crate::breakpoint::{Breakpoint, BreakpointChange, BreakpointConvertor};
use crate::paths::PathMapper;
use crate::protocol::{SetBreakpointsArguments, Source, SourceBreakpoint};

/// Protocol breakpoints grouped by adapter source path.
pub type BreakpointMap = BTreeMap<String, Vec<SourceBreakpoint>>;

/// Convert every breakpoint with every convertor and group the results by
/// source path. Within a source, entries keep conversion order.
pub fn convert_all(
    breakpoints: &[Breakpoint],
    convertors: &[Arc<dyn BreakpointConvertor>],
    paths: &dyn PathMapper,
) -> BreakpointMap {
    let mut map = BreakpointMap::new();
    for bp in breakpoints {
        for convertor in convertors {
            for converted in convertor.convert(bp, paths) {
                map.entry(converted.path)
                    .or_default()
                    .push(converted.breakpoint);
            }
        }
    }
    map
}

/// Sources whose breakpoint list may differ after `change`.
pub fn affected_paths(
    change: &BreakpointChange,
    convertors: &[Arc<dyn BreakpointConvertor>],
    paths: &dyn PathMapper,
) -> BTreeSet<String> {
    change
        .breakpoints()
        .into_iter()
        .flat_map(|bp| {
            convertors
                .iter()
                .flat_map(move |convertor| convertor.source_paths(bp, paths))
        })
        .collect()
}

/// Build the `setBreakpoints` payload carrying the complete list for one
/// source. An empty list clears the source.
pub fn set_breakpoints_arguments(
    path: &str,
    breakpoints: Vec<SourceBreakpoint>,
) -> SetBreakpointsArguments {
    let name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    SetBreakpointsArguments {
        source: Source {
            name,
            path: Some(path.to_string()),
            source_reference: None,
        },
        breakpoints,
    }
}

/// Payloads for exactly the given sources, taken from `map`.
pub fn plan<I>(sources: I, map: &BreakpointMap) -> Vec<SetBreakpointsArguments>
where
    I: IntoIterator<Item = String>,
{
    sources
        .into_iter()
        .map(|path| {
            let list = map.get(&path).cloned().unwrap_or_default();
            set_breakpoints_arguments(&path, list)
        })
        .collect()
}

/// Payloads for every source that currently has breakpoints.
pub fn plan_all(map: &BreakpointMap) -> Vec<SetBreakpointsArguments> {
    plan(map.keys().cloned(), map)
}
