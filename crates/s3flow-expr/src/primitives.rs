use std::collections::HashMap;
use std::fs;
use std::sync::{mpsc, Arc, RwLock};
use std::time::Duration;

use regex::Regex;
use rhai::{Dynamic, Engine, EvalAltResult, NativeCallContext};
use tracing::trace;

use crate::context::EvalContext;

/// How long `_jq` is allowed to run before its caller gets a timeout error.
pub const JQ_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type CurrentEnv = Arc<RwLock<Option<EvalContext>>>;
pub(crate) type CompiledPrograms = Arc<RwLock<HashMap<String, rhai::AST>>>;

fn rt_err(fn_name: &str, message: impl std::fmt::Display) -> Box<EvalAltResult> {
    format!("{fn_name}: {message}").into()
}

fn current_env(ctx: &CurrentEnv, fn_name: &str) -> Result<EvalContext, Box<EvalAltResult>> {
    ctx.read()
        .unwrap()
        .clone()
        .ok_or_else(|| rt_err(fn_name, "no environment bound for this evaluation"))
}

fn file_for(env: &EvalContext, fn_name: &str, selector: &str) -> Result<crate::context::DynamicInputFile, Box<EvalAltResult>> {
    env.file(selector)
        .cloned()
        .ok_or_else(|| rt_err(fn_name, format!("unknown file selector {selector:?}")))
}

/// Registers the nine built-in primitives on `engine`. `current_env` is the
/// slot [`crate::engine::ExpressionManager`] fills in immediately before
/// every top-level evaluation — this is how the hidden `$env` argument from
/// the original AST-rewrite design is threaded through without requiring
/// expression authors to pass it by hand.
pub(crate) fn register(engine: &mut Engine, current_env: CurrentEnv, programs: CompiledPrograms) {
    {
        let current_env = current_env.clone();
        let programs = programs.clone();
        engine.register_fn("_call", move |ctx: NativeCallContext, expr_name: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let t0 = std::time::Instant::now();
            // _call itself touches no file selector, but an environment must
            // already be bound so whatever the callee invokes can read it.
            let env = current_env(&current_env, "_call")?;

            // Prefer the calling type's own expression of this name; fall
            // back to a global lookup (e.g. a `dynamicFilters` entry) so a
            // bare name still resolves when the caller has no local match.
            let qualified = env.expr_prefix.as_ref().map(|prefix| format!("{prefix}::{expr_name}"));
            let registry = programs.read().unwrap();
            let ast = qualified
                .as_deref()
                .and_then(|name| registry.get(name))
                .or_else(|| registry.get(expr_name))
                .cloned()
                .ok_or_else(|| rt_err("_call", format!("expr {expr_name:?} not found")))?;
            drop(registry);

            let mut scope = rhai::Scope::new();
            let result = ctx
                .engine()
                .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                .map_err(|err| rt_err("_call", format!("expr {expr_name:?}: {err}")))?;

            trace!(expr_name, elapsed = ?t0.elapsed(), "_call");
            Ok(result)
        });
    }

    {
        let current_env = current_env.clone();
        engine.register_fn("_exist", move |selector: &str| -> Result<bool, Box<EvalAltResult>> {
            let env = current_env(&current_env, "_exist")?;
            let file = file_for(&env, "_exist", selector)?;

            if file.cache_key.is_empty() {
                return Ok(false);
            }

            match fs::metadata(&file.cache_key) {
                Ok(meta) => Ok(meta.len() > 0),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(rt_err("_exist", err)),
            }
        });
    }

    {
        let current_env = current_env.clone();
        engine.register_fn(
            "_jq",
            move |selector: &str, filter: &str| -> Result<Dynamic, Box<EvalAltResult>> {
                let t0 = std::time::Instant::now();
                let env = current_env(&current_env, "_jq")?;
                let file = file_for(&env, "_jq", selector)?;

                if file.cache_key.is_empty() {
                    return Ok(Dynamic::UNIT);
                }

                let result = run_jq_bounded(file.cache_key.clone(), filter.to_string())?;
                trace!(selector, elapsed = ?t0.elapsed(), "_jq");
                Ok(result)
            },
        );
    }

    {
        let current_env = current_env.clone();
        engine.register_fn("_loadJSON", move |selector: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let env = current_env(&current_env, "_loadJSON")?;
            let file = file_for(&env, "_loadJSON", selector)?;
            load_json(&file.cache_key).map_err(|err| rt_err("_loadJSON", err))
        });
    }

    engine.register_fn("_merge", |a: rhai::Map, b: rhai::Map| -> rhai::Map {
        let mut merged = a;
        for (k, v) in b {
            merged.insert(k, v);
        }
        merged
    });

    engine.register_fn(
        "_replaceRegex",
        |s: &str, pattern: &str, repl: &str| -> Result<String, Box<EvalAltResult>> {
            let re = Regex::new(pattern).map_err(|err| rt_err("_replaceRegex", err))?;
            Ok(re.replace_all(s, repl).into_owned())
        },
    );

    {
        let current_env = current_env.clone();
        engine.register_fn("_s3Key", move |selector: &str| -> Result<String, Box<EvalAltResult>> {
            let env = current_env(&current_env, "_s3Key")?;
            let file = file_for(&env, "_s3Key", selector)?;
            Ok(file.s3_path)
        });
    }

    engine.register_fn("_title", |s: &str| -> String { title_case(s) });

    {
        engine.register_fn(
            "_xpath",
            move |selector: &str, xpath_expr: &str| -> Result<String, Box<EvalAltResult>> {
                let env = current_env(&current_env, "_xpath")?;
                let file = file_for(&env, "_xpath", selector)?;
                run_xpath(&file.cache_key, xpath_expr).map_err(|err| rt_err("_xpath", err))
            },
        );
    }
}

/// Title-cases `s` word by word, then turns underscores into spaces —
/// matching the original's "title then de-snake" order so
/// `"san_francisco"` becomes `"San Francisco"`.
pub(crate) fn title_case(s: &str) -> String {
    let titled: String = s
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    titled.replace('_', " ")
}

fn load_json(path: &str) -> Result<Dynamic, String> {
    let raw = fs::read_to_string(path).map_err(|err| err.to_string())?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|err| err.to_string())?;
    rhai::serde::to_dynamic(&value).map_err(|err| err.to_string())
}

/// Runs a jq filter against the JSON at `path`, bounded by [`JQ_TIMEOUT`].
/// jaq's evaluation is synchronous, so the bound is enforced by running it
/// on a helper thread and giving up on a recv timeout rather than by
/// cancelling the thread — matching the original's "ceiling, not
/// cancellation" contract for this primitive.
fn run_jq_bounded(path: String, filter: String) -> Result<Dynamic, Box<EvalAltResult>> {
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        let result = run_jq(&path, &filter);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(JQ_TIMEOUT) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(rt_err("_jq", message)),
        Err(_) => Err(rt_err("_jq", format!("timed out after {}s", JQ_TIMEOUT.as_secs()))),
    }
}

fn run_jq(path: &str, filter_src: &str) -> Result<Dynamic, String> {
    use jaq_core::load::{Arena, File, Loader};

    let raw = fs::read_to_string(path).map_err(|err| err.to_string())?;
    let input: serde_json::Value = serde_json::from_str(&raw).map_err(|err| err.to_string())?;

    let program = File {
        code: filter_src,
        path: (),
    };

    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = Arena::default();
    let modules = loader
        .load(&arena, program)
        .map_err(|errs| format!("{} error(s) parsing jq filter", errs.len()))?;

    let filter = jaq_core::Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|errs| format!("{} error(s) compiling jq filter", errs.len()))?;

    let inputs = jaq_core::RcIter::new(core::iter::empty());
    let ctx = jaq_core::Ctx::new([], &inputs);
    let mut outputs = filter.run((ctx, jaq_json::Val::from(input)));

    match outputs.next() {
        None => Ok(Dynamic::UNIT),
        Some(Ok(value)) => {
            let json: serde_json::Value = value.into();
            rhai::serde::to_dynamic(&json).map_err(|err| err.to_string())
        }
        Some(Err(err)) => Err(err.to_string()),
    }
}

fn run_xpath(path: &str, expr: &str) -> Result<String, String> {
    let raw = fs::read_to_string(path).map_err(|err| err.to_string())?;
    let package = sxd_document::parser::parse(&raw).map_err(|err| err.to_string())?;
    let document = package.as_document();

    let factory = sxd_xpath::Factory::new();
    let xpath = factory
        .build(expr)
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "empty xpath expression".to_string())?;

    let context = sxd_xpath::Context::new();
    let value = xpath
        .evaluate(&context, document.root())
        .map_err(|err| err.to_string())?;

    Ok(value.string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_case_then_underscore_to_space() {
        assert_eq!(title_case("san_francisco"), "San Francisco");
        assert_eq!(title_case("already title"), "Already Title");
    }
}
