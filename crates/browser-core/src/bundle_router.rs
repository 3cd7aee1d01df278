//! The six BundleRouter handlers: Boot, Program, Stick, StickAuthority,
//! Jump, Metric, Expansion (spec.md §4.8, SPEC_FULL §4.8's
//! StickAuthority supplement).
//!
//! Grounded on `original_source/backend-server/app/command/controlcmds.py`
//! (`BootstrapHandler`, `ProgramHandler`, `StickHandler`,
//! `StickAuthorityHandler`), `command/datacmd.py::JumpHandler`, and
//! `util/influx.py`/`command/metriccmd.py` (`MetricHandler`'s
//! unmangle-and-format pipeline).

use async_trait::async_trait;
use ciborium::value::Value;

use crate::cache::JumpEntry;
use crate::handler::{Handler, HandlerContext, Response};

fn text_list(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::Text).collect())
}

/// `kind=0`. Replies with the boot payload (namespace, assets, supported
/// versions) and attaches the boot bundles/tracks for the requested
/// version. Mirrors `BootstrapHandler.process`.
pub struct BootstrapHandler {
    pub supported_versions: Vec<u32>,
}

#[async_trait]
impl Handler for BootstrapHandler {
    async fn process(&self, ctx: &HandlerContext<'_>, _payload: &Value) -> Response {
        let egs = ctx.version.egs;
        let Ok(boot_bundles) = ctx.accessor.bundles.boot_bundles(egs) else {
            return Response::error(format!("Backend out of date: Doesn't support egs version {egs}"));
        };

        let payload = Value::Map(vec![
            (Value::Text("namespace".into()), ctx.channel.to_value()),
            (
                Value::Text("supports".into()),
                Value::Array(self.supported_versions.iter().map(|&v| Value::Integer(v.into())).collect()),
            ),
        ]);
        let mut response = Response::new(0, &payload);
        for bundle in boot_bundles {
            response.add_bundle(bundle);
        }
        let boot_tracks = ctx.accessor.tracks.clone();
        response.add_tracks(boot_tracks);
        response
    }
}

/// `kind=1`. `(program_set, program_name, program_version)` -> attach the
/// matching bundle. Mirrors `ProgramHandler.process`.
pub struct ProgramHandler;

#[async_trait]
impl Handler for ProgramHandler {
    async fn process(&self, ctx: &HandlerContext<'_>, payload: &Value) -> Response {
        let Some(items) = payload.as_array() else {
            return Response::error("malformed program request");
        };
        let Some(name) = items.first().and_then(|v| v.as_text()) else {
            return Response::error("malformed program request");
        };
        match ctx.accessor.bundles.find_bundle(ctx.version.egs, name) {
            Ok(Some(bundle)) => {
                let mut response = Response::new(1, &Value::Array(vec![]));
                response.add_bundle(bundle);
                response
            }
            Ok(None) => Response::error(format!("unknown program: {name}")),
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn remote_prefix(&self, payload: &Value) -> Option<Vec<String>> {
        let name = payload.as_array()?.first()?.as_text()?.to_string();
        Some(vec!["program".to_string(), name])
    }
}

/// `kind=2`. Stick id -> `{id, size, topology, tags}`. Mirrors
/// `StickHandler.process`.
pub struct StickHandler;

#[async_trait]
impl Handler for StickHandler {
    async fn process(&self, ctx: &HandlerContext<'_>, payload: &Value) -> Response {
        let Some(name) = payload.as_text() else {
            return Response::error("malformed stick request");
        };
        match ctx.accessor.species.stick(name).await {
            Some(chrom) => {
                let body = Value::Map(vec![
                    (Value::Text("id".into()), Value::Text(chrom.id)),
                    (Value::Text("size".into()), Value::Integer(chrom.size.into())),
                    (Value::Text("topology".into()), Value::Integer(chrom.topology.to_wire().into())),
                    (Value::Text("tags".into()), text_list(&chrom.tags)),
                ]);
                Response::new(2, &body)
            }
            None => Response::error(format!("unknown stick: {name}")),
        }
    }

    fn remote_prefix(&self, payload: &Value) -> Option<Vec<String>> {
        let name = payload.as_text()?.to_string();
        Some(vec!["stick".to_string(), name])
    }
}

/// `kind=3` (SPEC_FULL supplement). Replies with the authority's
/// startup/lookup/jump program names, or an "I am not an authority"
/// error for a deployment with no stick authority configured. Mirrors
/// `StickAuthorityHandler.process`.
pub struct StickAuthorityHandler;

#[async_trait]
impl Handler for StickAuthorityHandler {
    async fn process(&self, ctx: &HandlerContext<'_>, _payload: &Value) -> Response {
        let Ok((startup, lookup, jump)) = ctx.accessor.bundles.stick_authority_programs(ctx.version.egs) else {
            return Response::error("I am not an authority");
        };
        let (Some(startup), Some(lookup), Some(jump)) = (startup, lookup, jump) else {
            return Response::error("I am not an authority");
        };
        let body = Value::Array(vec![
            ctx.channel.to_value(),
            Value::Text(startup),
            Value::Text(lookup),
            Value::Text(jump),
        ]);
        Response::new(4, &body)
    }
}

/// `kind=5`. Resolves a `focus:...` lookup string through the jump
/// cache, returning `(stick, left, right)` or `{no: true}`. Mirrors
/// `datacmd.py::JumpHandler.process` / `data/focusjump.py`.
pub struct JumpHandler {
    pub resolver: std::sync::Arc<dyn JumpResolver>,
}

/// The indexed-disk jump lookup, one per genome, external to this crate
/// per spec.md §1's out-of-scope boundary. Mirrors
/// `data/focusjump.py::FocusJumpHandler.get`.
#[async_trait]
pub trait JumpResolver: Send + Sync {
    async fn lookup(&self, location: &str) -> Option<(String, u64, u64)>;
}

/// A resolver with no configured index; every lookup misses.
pub struct EmptyJumpResolver;

#[async_trait]
impl JumpResolver for EmptyJumpResolver {
    async fn lookup(&self, _location: &str) -> Option<(String, u64, u64)> {
        None
    }
}

#[async_trait]
impl Handler for JumpHandler {
    async fn process(&self, ctx: &HandlerContext<'_>, payload: &Value) -> Response {
        let Some(location) = payload.as_text() else {
            return Response::error("malformed jump request");
        };
        if let Some(entry) = ctx.accessor.cache.get_jump(location, ctx.version.egs).await {
            return Response::new(6, &entry.to_value());
        }
        match self.resolver.lookup(location).await {
            Some((stick, left, right)) => {
                let entry = JumpEntry { stick, left, right };
                ctx.accessor.cache.set_jump(location, ctx.version.egs, &entry).await;
                Response::new(6, &entry.to_value())
            }
            None => Response::new(6, &Value::Map(vec![(Value::Text("no".into()), Value::Bool(true))])),
        }
    }

    fn remote_prefix(&self, _payload: &Value) -> Option<Vec<String>> {
        Some(vec!["jump".to_string()])
    }
}

/// `kind=6`. Accepts structured telemetry, unmangles column-compressed
/// variants, formats line-protocol records, forwards them to the
/// metrics sink. Non-fatal: a sink failure never fails the request.
/// Mirrors `metriccmd.py::MetricHandler`/`GeneralMetricHandler`/
/// `DatastreamMetricHandler`/`ProgramRunMetricHandler`.
pub struct MetricHandler {
    pub sink: std::sync::Arc<dyn crate::metrics::MetricsSink>,
}

impl MetricHandler {
    /// `Datastream` metrics come column-compressed: `names`/`keys`
    /// arrays indexed by a per-event `idx`, plus a packed `batch` flag
    /// array and `counts`/`sizes`. Mirrors `unmangle()`.
    fn format_datastream(&self, payload: &Value) -> Vec<String> {
        let Some(map) = payload.as_map() else { return Vec::new() };
        let get = |key: &str| map.iter().find(|(k, _)| k.as_text() == Some(key)).map(|(_, v)| v);
        let names = get("names").and_then(Value::as_array).cloned().unwrap_or_default();
        let keys = get("keys").and_then(Value::as_array).cloned().unwrap_or_default();
        let scales = get("scale").and_then(Value::as_array).cloned().unwrap_or_default();
        let priorities = get("priority").and_then(Value::as_array).cloned().unwrap_or_default();
        let events = get("events").and_then(Value::as_array).cloned().unwrap_or_default();
        let sizes = get("size").and_then(Value::as_array).cloned().unwrap_or_default();

        let mut lines = Vec::new();
        for idx in 0..names.len().min(keys.len()) {
            let name = names[idx].as_text().unwrap_or_default();
            let key = keys[idx].as_text().unwrap_or_default();
            let scale = scales.get(idx).and_then(Value::as_integer).and_then(|i| i64::try_from(i).ok()).unwrap_or(0);
            let priority = priorities
                .get(idx)
                .and_then(Value::as_bool)
                .map(|batch| if batch { "batch" } else { "realtime" })
                .unwrap_or("realtime");
            let count = events.get(idx).and_then(Value::as_integer).and_then(|i| i64::try_from(i).ok()).unwrap_or(0);
            let bytes = sizes.get(idx).and_then(Value::as_integer).and_then(|i| i64::try_from(i).ok()).unwrap_or(0);
            let mut line = format!(
                "gb-requests,name={name},key={key},scale={scale},priority={priority} count={count},bytes={bytes}"
            );
            if count > 0 {
                line.push_str(&format!(",bpc={}", bytes as f64 / count as f64));
            }
            lines.push(line);
        }
        lines
    }

    /// Mirrors `ProgramRunMetricHandler.to_influx`: reported
    /// `time_ms` is actually the handler's own overhead,
    /// `net_ms - time_ms`.
    fn format_program_run(&self, payload: &Value) -> Option<String> {
        let map = payload.as_map()?;
        let get = |key: &str| map.iter().find(|(k, _)| k.as_text() == Some(key)).map(|(_, v)| v);
        let name = get("name")?.as_text()?;
        let scale = get("scale")?.as_integer().and_then(|i| i64::try_from(i).ok())?;
        let warm = get("warm").and_then(Value::as_bool).unwrap_or(false);
        let net_ms = get("net_ms")?.as_integer().and_then(|i| i64::try_from(i).ok())?;
        let time_ms = get("time_ms")?.as_integer().and_then(|i| i64::try_from(i).ok())?;
        Some(format!(
            "prog-time,name={name},scale={scale},warm={warm} net_ms={net_ms},time_ms={}",
            net_ms - time_ms
        ))
    }

    fn format_general(&self, payload: &Value) -> String {
        format!("gb-event value=\"{}\"", value_to_debug_string(payload))
    }
}

fn value_to_debug_string(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        other => format!("{other:?}"),
    }
}

#[async_trait]
impl Handler for MetricHandler {
    async fn process(&self, _ctx: &HandlerContext<'_>, payload: &Value) -> Response {
        let map = payload.as_map();
        let metric_type = map
            .and_then(|m| m.iter().find(|(k, _)| k.as_text() == Some("type")))
            .and_then(|(_, v)| v.as_text())
            .unwrap_or("");
        let inner = map
            .and_then(|m| m.iter().find(|(k, _)| k.as_text() == Some("data")))
            .map(|(_, v)| v)
            .unwrap_or(payload);

        let lines = match metric_type {
            "Client" => {
                let mut lines = self.format_datastream(inner);
                if let Some(line) = self.format_program_run(inner) {
                    lines.push(line);
                }
                lines
            }
            _ => vec![self.format_general(inner)],
        };
        if !lines.is_empty() {
            self.sink.send(&format!("{}\n", lines.join("\n"))).await;
        }
        Response::new(2, &Value::Array(vec![]))
    }

    fn remote_prefix(&self, _payload: &Value) -> Option<Vec<String>> {
        Some(vec!["metric".to_string()])
    }
}

/// `kind=7`. `(name, step)` -> declared expansion -> synthesised
/// `Tracks` attached to the reply. Mirrors `ExpansionHandler` /
/// `model/expansions.py::Expansions`.
pub struct ExpansionHandler;

#[async_trait]
impl Handler for ExpansionHandler {
    async fn process(&self, ctx: &HandlerContext<'_>, payload: &Value) -> Response {
        let Some(items) = payload.as_array() else {
            return Response::error("malformed expansion request");
        };
        let (Some(name), Some(step)) = (items.first().and_then(Value::as_text), items.get(1).and_then(Value::as_text)) else {
            return Response::error("malformed expansion request");
        };
        let Some(expansion) = ctx.accessor.tracks.get_expansion(name) else {
            return Response::error(format!("unknown expansion: {name}"));
        };
        let Some(callback_name) = expansion.callback() else {
            return Response::error(format!("expansion {name} has no callback"));
        };
        match ctx.accessor.expansions.invoke(callback_name, step).await {
            Ok(tracks) => {
                let mut response = Response::new(7, &Value::Array(vec![]));
                response.add_tracks(tracks);
                response
            }
            Err(err) => Response::error(err.to_string()),
        }
    }
}
