//! Python harness run inside every worker process.
//!
//! The harness applies the kernel limits, installs the filesystem and network
//! guards, loads `artifact.py` from the scratch directory, calls the entry
//! point with the JSON arguments read from stdin, and prints exactly one
//! report line prefixed with [`REPORT_MARKER`]. Anything the artifact prints
//! goes to stderr.

use serde::Deserialize;
use serde_json::Value;

pub const HARNESS_FILE: &str = "_toolforge_harness.py";
pub const ARTIFACT_FILE: &str = "artifact.py";
pub const REPORT_MARKER: &str = "__TOOLFORGE_RESULT__";

pub const HARNESS_SOURCE: &str = r#"
import builtins
import io
import json
import os
import resource
import socket
import sys
import traceback

MARKER = "__TOOLFORGE_RESULT__"
_stdout = sys.stdout
sys.stdout = sys.stderr

SCRATCH = os.path.realpath(os.environ["TOOLFORGE_SCRATCH"])
ENTRY = os.environ["TOOLFORGE_ENTRY"]
CPU_LIMIT = int(os.environ.get("TOOLFORGE_CPU_LIMIT", "0"))
MEMORY_LIMIT = int(os.environ.get("TOOLFORGE_MEMORY_LIMIT", "0"))
NETWORK = os.environ.get("TOOLFORGE_NETWORK") == "1"
HOSTS = {h for h in os.environ.get("TOOLFORGE_ALLOWED_HOSTS", "").split(",") if h}

_violations = []


class SandboxViolation(BaseException):
    pass


def _deny(detail):
    _violations.append(detail)
    raise SandboxViolation(detail)


def _report(payload):
    ru = resource.getrusage(resource.RUSAGE_SELF)
    scale = 1 if sys.platform == "darwin" else 1024
    payload["usage"] = {
        "cpu_ms": int((ru.ru_utime + ru.ru_stime) * 1000),
        "memory_peak_bytes": int(ru.ru_maxrss) * scale,
    }
    _stdout.write(MARKER + json.dumps(payload) + "\n")
    _stdout.flush()


def _error(kind, message, trace=""):
    _report({"status": "error", "kind": kind, "message": message, "trace": trace})


if CPU_LIMIT > 0:
    resource.setrlimit(resource.RLIMIT_CPU, (CPU_LIMIT, CPU_LIMIT + 1))
if MEMORY_LIMIT > 0:
    try:
        resource.setrlimit(resource.RLIMIT_AS, (MEMORY_LIMIT, MEMORY_LIMIT))
    except (ValueError, OSError):
        pass

_open = builtins.open


def _inside_scratch(path):
    return path == SCRATCH or path.startswith(SCRATCH + os.sep)


def _guarded_open(file, mode="r", *args, **kwargs):
    if not isinstance(file, int):
        path = os.fspath(file)
        if isinstance(path, bytes):
            path = os.fsdecode(path)
        path = os.path.realpath(path)
        if any(flag in mode for flag in "wax+") and not _inside_scratch(path):
            _deny("write outside scratch: " + path)
    return _open(file, mode, *args, **kwargs)


builtins.open = _guarded_open
io.open = _guarded_open

_getaddrinfo = socket.getaddrinfo
_connect = socket.socket.connect
_connect_ex = socket.socket.connect_ex
_resolved = set()


def _check_host(host):
    if not NETWORK:
        _deny("network access disabled")
    if HOSTS and host not in HOSTS and host not in _resolved:
        _deny("host not allowed: " + str(host))


def _guarded_getaddrinfo(host, *args, **kwargs):
    name = host.decode() if isinstance(host, bytes) else str(host)
    if not NETWORK:
        _deny("network access disabled")
    if HOSTS and name not in HOSTS:
        _deny("host not allowed: " + name)
    result = _getaddrinfo(host, *args, **kwargs)
    for entry in result:
        _resolved.add(entry[4][0])
    return result


def _guarded_connect(self, address):
    _check_host(address[0] if isinstance(address, tuple) else address)
    return _connect(self, address)


def _guarded_connect_ex(self, address):
    _check_host(address[0] if isinstance(address, tuple) else address)
    return _connect_ex(self, address)


socket.getaddrinfo = _guarded_getaddrinfo
socket.socket.connect = _guarded_connect
socket.socket.connect_ex = _guarded_connect_ex


def main():
    try:
        args = json.loads(sys.stdin.read() or "null")
    except ValueError as exc:
        _error("runtime", "invalid arguments: %s" % exc)
        return

    namespace = {"__name__": "toolforge_artifact"}
    try:
        with _open(os.path.join(SCRATCH, "artifact.py"), "r") as fh:
            code = compile(fh.read(), "artifact.py", "exec")
        exec(code, namespace)
        fn = namespace.get(ENTRY)
        if not callable(fn):
            raise NameError("entry point %r is not defined" % ENTRY)
        result = fn(args)
        try:
            value = json.loads(json.dumps(result))
        except (TypeError, ValueError) as exc:
            raise TypeError("result is not JSON-serializable: %s" % exc)
        if _violations:
            _error("policy", _violations[0])
        else:
            _report({"status": "ok", "value": value})
    except SandboxViolation as exc:
        _error("policy", str(exc))
    except MemoryError:
        _error("memory", "MemoryError")
    except BaseException as exc:
        if _violations:
            _error("policy", _violations[0], traceback.format_exc())
        else:
            _error("runtime", "%s: %s" % (type(exc).__name__, exc), traceback.format_exc())


main()
"#;

/// The report line printed by the harness.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HarnessReport {
    pub status: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
    #[serde(default)]
    pub usage: Option<ReportedUsage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ReportedUsage {
    #[serde(default)]
    pub cpu_ms: u64,
    #[serde(default)]
    pub memory_peak_bytes: u64,
}

/// Find the last report line in captured stdout.
pub fn parse_report(stdout: &str) -> Option<HarnessReport> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(REPORT_MARKER))
        .and_then(|json| serde_json::from_str(json).ok())
}
