//! Pattern security gate.
//!
//! Flags dynamic evaluation, process spawning, raw sockets, and file access
//! outside the scratch directory. Reflection builtins and string literals
//! naming interpreter internals count as dynamic evaluation. Reports the
//! earliest finding in source order.

use crate::domain::{SourceLocation, ValidationFault};

use super::syntax::{CallSite, SourceIndex};

pub const DYNAMIC_EVAL: &str = "dynamic-eval";
pub const PROCESS_SPAWN: &str = "process-spawn";
pub const RAW_SOCKET: &str = "raw-socket";
pub const FILESYSTEM_ESCAPE: &str = "filesystem-escape";

const EVAL_BUILTINS: &[&str] = &["eval", "exec", "compile", "__import__"];
const ESCAPE_HATCHES: &[&str] = &["__builtins__", "__globals__", "__subclasses__", "__code__"];
const REFLECTION_BUILTINS: &[&str] =
    &["globals", "locals", "vars", "getattr", "setattr", "delattr"];
const OPEN_CALLEES: &[&str] = &["open", "io.open", "builtins.open", "codecs.open"];

fn classify_call(call: &CallSite) -> Option<&'static str> {
    let callee = call.callee.as_str();
    let bare = callee.strip_prefix("builtins.").unwrap_or(callee);

    if EVAL_BUILTINS.contains(&bare)
        || REFLECTION_BUILTINS.contains(&bare)
        || callee == "importlib.import_module"
    {
        return Some(DYNAMIC_EVAL);
    }
    if callee == "os.system"
        || callee == "os.popen"
        || callee.starts_with("os.exec")
        || callee.starts_with("os.spawn")
        || callee.starts_with("os.fork")
        || callee.starts_with("subprocess.")
        || callee == "pty.spawn"
    {
        return Some(PROCESS_SPAWN);
    }
    if callee == "socket"
        || callee.starts_with("socket.")
        || callee.ends_with("urlopen")
        || callee.ends_with("create_connection")
    {
        return Some(RAW_SOCKET);
    }
    if OPEN_CALLEES.contains(&callee) {
        if let Some(path) = call.first_literal.as_deref() {
            if escapes_scratch(path) {
                return Some(FILESYSTEM_ESCAPE);
            }
        }
    }
    None
}

/// `__import__`, `__builtins__`, and the other dunder escape hatches.
fn names_interpreter_internal(literal: &str) -> bool {
    let name = literal.trim();
    name.starts_with("__")
        && (ESCAPE_HATCHES.contains(&name) || EVAL_BUILTINS.contains(&name))
}

/// Absolute, home-relative, or parent-escaping literal paths.
pub fn escapes_scratch(path: &str) -> bool {
    let p = path.trim();
    p.starts_with('/')
        || p.starts_with('\\')
        || p.starts_with('~')
        || p.as_bytes().get(1) == Some(&b':')
        || p.split(['/', '\\']).any(|part| part == "..")
}

/// Gate 3.
pub fn check(index: &SourceIndex) -> Result<(), ValidationFault> {
    let mut findings: Vec<(SourceLocation, &'static str)> = Vec::new();

    for call in &index.calls {
        if let Some(pattern) = classify_call(call) {
            findings.push((call.location, pattern));
        }
    }
    for name in &index.names {
        if EVAL_BUILTINS.contains(&name.name.as_str())
            || ESCAPE_HATCHES.contains(&name.name.as_str())
        {
            findings.push((name.location, DYNAMIC_EVAL));
        }
    }
    for attr in &index.attributes {
        if ESCAPE_HATCHES.contains(&attr.name.as_str()) {
            findings.push((attr.location, DYNAMIC_EVAL));
        }
    }

    for literal in &index.strings {
        if names_interpreter_internal(&literal.name) {
            findings.push((literal.location, DYNAMIC_EVAL));
        }
    }

    match findings
        .into_iter()
        .min_by_key(|(loc, _)| (loc.line, loc.column))
    {
        Some((location, pattern)) => Err(ValidationFault::Security {
            pattern: pattern.to_string(),
            location,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_of(src: &str) -> Option<String> {
        match check(&SourceIndex::parse(src).unwrap()) {
            Err(ValidationFault::Security { pattern, .. }) => Some(pattern),
            Err(other) => panic!("unexpected fault {other:?}"),
            Ok(()) => None,
        }
    }

    #[test]
    fn clean_code_passes() {
        let src = "import re\n\ndef words(text: str) -> list:\n    return re.compile(r'\\w+').findall(text)\n";
        assert_eq!(pattern_of(src), None);
    }

    #[test]
    fn dynamic_eval_detected() {
        assert_eq!(
            pattern_of("def f(x):\n    return eval(x)\n").as_deref(),
            Some(DYNAMIC_EVAL)
        );
        assert_eq!(
            pattern_of("def f(x):\n    g = exec\n    return g\n").as_deref(),
            Some(DYNAMIC_EVAL)
        );
        assert_eq!(
            pattern_of("def f(x):\n    return ().__class__.__base__.__subclasses__()\n").as_deref(),
            Some(DYNAMIC_EVAL)
        );
    }

    #[test]
    fn reflection_builtins_are_dynamic_eval() {
        for src in [
            "def f(x):\n    return globals()\n",
            "def f(x):\n    return vars(x)\n",
            "def f(x):\n    return locals()\n",
            "def f(x):\n    return getattr(x, 'system')\n",
            "def f(x):\n    setattr(x, 'y', 1)\n",
        ] {
            assert_eq!(pattern_of(src).as_deref(), Some(DYNAMIC_EVAL), "{src}");
        }
    }

    #[test]
    fn builtins_lookup_by_string_is_dynamic_eval() {
        let src = "def run(x):\n    b = {}\n    b = b['__builtins__']\n    imp = b['__import__']\n    return imp('os').system('id')\n";
        match check(&SourceIndex::parse(src).unwrap()) {
            Err(ValidationFault::Security { pattern, location }) => {
                assert_eq!(pattern, DYNAMIC_EVAL);
                assert_eq!(location.line, 3);
            }
            other => panic!("expected security fault, got {other:?}"),
        }
        assert_eq!(pattern_of("def f(x):\n    return {'__init__': x}\n"), None);
        assert_eq!(pattern_of("def f(x):\n    return x + '__import__ is blocked'\n"), None);
    }

    #[test]
    fn process_spawn_detected_through_alias() {
        let src = "import subprocess as sp\n\ndef f(x):\n    return sp.check_output(['id'])\n";
        assert_eq!(pattern_of(src).as_deref(), Some(PROCESS_SPAWN));
        assert_eq!(
            pattern_of("import os\n\ndef f(x):\n    os.system('id')\n").as_deref(),
            Some(PROCESS_SPAWN)
        );
    }

    #[test]
    fn raw_socket_detected() {
        let src = "from urllib.request import urlopen\n\ndef f(x):\n    return urlopen(x).read()\n";
        assert_eq!(pattern_of(src).as_deref(), Some(RAW_SOCKET));
    }

    #[test]
    fn filesystem_escape_only_for_literal_escapes() {
        assert_eq!(
            pattern_of("def f(x):\n    return open('/etc/passwd').read()\n").as_deref(),
            Some(FILESYSTEM_ESCAPE)
        );
        assert_eq!(
            pattern_of("def f(x):\n    return open('../secret').read()\n").as_deref(),
            Some(FILESYSTEM_ESCAPE)
        );
        assert_eq!(
            pattern_of("def f(x):\n    with open('out.txt', 'w') as fh:\n        fh.write(x)\n"),
            None
        );
    }

    #[test]
    fn reports_earliest_location() {
        let src = "def f(x):\n    a = eval(x)\n    return open('/etc/hosts')\n";
        match check(&SourceIndex::parse(src).unwrap()) {
            Err(ValidationFault::Security { location, .. }) => assert_eq!(location.line, 2),
            other => panic!("expected security fault, got {other:?}"),
        }
    }
}
