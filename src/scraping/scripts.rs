//! JavaScript shipped into the page.
//!
//! `prelude()` installs `window.__threadHarvest` once per document. Every
//! other function here builds a single expression that re-runs the (idempotent)
//! prelude and then calls into it, so it works even on a document the
//! new-document hook missed. Arguments are embedded as JSON literals.

use crate::core::sandbox::{CaptureRequest, ScrollEdge};
use crate::extraction::store_locator::LocatedStore;
use serde::Serialize;

/// Name of the `Runtime.addBinding` function appended elements are sent through.
pub const BINDING_NAME: &str = "__threadHarvestEmit";

pub fn prelude() -> String {
    r#"
(function () {
  if (window.__threadHarvest) return;

  const SLOTS = ['memoizedProps', 'memoizedState', 'stateNode.props', 'stateNode.state'];
  const ROOT_SELECTORS = ['#root', '#__next', '#app', '[data-reactroot]'];
  const BINDING = '__threadHarvestEmit';
  const objectIds = new WeakMap();
  const disposers = new Map();
  let nextObjectId = 1;

  function fiberOf(el) {
    if (!el) return null;
    for (const k of Object.keys(el)) {
      if (k.startsWith('__reactFiber$') || k.startsWith('__reactInternalInstance$')) return el[k];
    }
    return null;
  }

  function rootElement() {
    for (const sel of ROOT_SELECTORS) {
      const c = document.querySelector(sel);
      if (c && c.firstElementChild) return c.firstElementChild;
    }
    const all = document.body ? document.body.querySelectorAll('*') : [];
    for (const el of all) {
      if (fiberOf(el)) return el;
    }
    return null;
  }

  function slot(fiber, path) {
    try {
      if (path === 'stateNode.props') return fiber.stateNode && fiber.stateNode.props;
      if (path === 'stateNode.state') return fiber.stateNode && fiber.stateNode.state;
      return fiber[path];
    } catch (_) {
      return undefined;
    }
  }

  function serialize(v, depth, seen) {
    if (v === null || v === undefined) return v === null ? null : undefined;
    const t = typeof v;
    if (t === 'function' || t === 'symbol') return undefined;
    if (t === 'bigint') return String(v);
    if (t === 'number') return isFinite(v) ? v : null;
    if (t !== 'object') return v;
    if (depth <= 0 || seen.has(v)) return null;
    if ((typeof Node !== 'undefined' && v instanceof Node) || v === window) return null;
    if (v.$$typeof) return null;
    if (v instanceof Date) return v.getTime();
    seen.add(v);
    let out;
    try {
      if (Array.isArray(v) || (typeof v.length === 'number' && typeof v.push === 'function')) {
        out = [];
        const n = Math.min(v.length, 500);
        for (let i = 0; i < n; i++) {
          const s = serialize(v[i], depth - 1, seen);
          out.push(s === undefined ? null : s);
        }
      } else if (v instanceof Map) {
        out = {};
        for (const [k, x] of v) {
          if (typeof k !== 'string') continue;
          const s = serialize(x, depth - 1, seen);
          if (s !== undefined) out[k] = s;
        }
      } else {
        out = {};
        let count = 0;
        for (const k in v) {
          if (++count > 200) break;
          if (k.startsWith('_') && k !== '_id') continue;
          let x;
          try { x = v[k]; } catch (_) { continue; }
          const s = serialize(x, depth - 1, seen);
          if (s !== undefined) out[k] = s;
        }
      }
    } finally {
      seen.delete(v);
    }
    return out;
  }

  function clone(v) {
    const s = serialize(v, 8, new Set());
    return s === undefined ? null : s;
  }

  function hasKey(obj, keys) {
    if (!obj || typeof obj !== 'object') return false;
    for (const k of keys) {
      try { if (k in obj) return true; } catch (_) { return false; }
    }
    return false;
  }

  function classOf(el) {
    const c = el.getAttribute && el.getAttribute('class');
    return c == null ? null : String(c);
  }

  function capture(req) {
    const all = Array.from(document.querySelectorAll('*'));
    const docIndex = new Map();
    all.forEach((el, i) => docIndex.set(el, i));

    const out = {
      timeOrigin: performance.timeOrigin,
      capturedAt: Date.now(),
      elements: [],
      nodes: [],
      anchors: [],
      root: null,
    };
    const nodeIds = new Map();
    const elementIds = new Map();
    // Levels recorded upward from each node, itself included.
    const reach = [];
    const keys = req.keys || [];

    function addChain(fiber) {
      let first = null;
      let prev = null;
      let f = fiber;
      for (let hops = 0; f && hops < req.maxDepth; hops++) {
        let id = nodeIds.get(f);
        const budget = req.maxDepth - hops;
        const covered = id !== undefined && reach[id] >= budget;
        if (id === undefined) {
          id = out.nodes.length;
          nodeIds.set(f, id);
          const slots = {};
          for (const path of SLOTS) {
            const value = slot(f, path);
            if (hasKey(value, keys)) {
              const s = serialize(value, 6, new Set());
              if (s !== undefined && s !== null) slots[path] = s;
            }
          }
          out.nodes.push({ id, parent: null, slots });
        }
        if (prev !== null) out.nodes[prev].parent = id;
        if (first === null) first = id;
        if (covered) break;
        reach[id] = budget;
        prev = id;
        f = f.return;
      }
      return first;
    }

    function addElement(el, inScan) {
      let id = elementIds.get(el);
      if (id !== undefined) {
        if (inScan) out.elements[id].inScan = true;
        return id;
      }
      id = out.elements.length;
      elementIds.set(el, id);
      const entry = {
        id,
        docIndex: docIndex.has(el) ? docIndex.get(el) : all.length + id,
        tag: el.tagName ? el.tagName.toLowerCase() : '',
        className: classOf(el),
        node: null,
        inScan,
        within: null,
      };
      out.elements.push(entry);
      const fiber = fiberOf(el);
      if (fiber) entry.node = addChain(fiber);
      return id;
    }

    for (const selector of req.anchors || []) {
      let el = null;
      try { el = document.querySelector(selector); } catch (_) { el = null; }
      out.anchors.push({ selector, element: el ? addElement(el, false) : null });
    }

    const rootEl = rootElement();
    if (rootEl) {
      const fiber = fiberOf(rootEl);
      if (fiber) out.root = addChain(fiber);
    }

    let scopeEl = null;
    if (req.scope) {
      try { scopeEl = document.querySelector(req.scope); } catch (_) { scopeEl = null; }
    }

    if (req.classFragment) {
      const scopeId = scopeEl ? addElement(scopeEl, false) : null;
      const pool = scopeEl ? Array.from(scopeEl.querySelectorAll('*')) : all;
      let matched = 0;
      for (const el of pool) {
        const c = classOf(el);
        if (!c || !c.includes(req.classFragment)) continue;
        if (matched++ < req.maxCandidates) {
          const id = addElement(el, false);
          if (scopeId !== null && id !== scopeId) out.elements[id].within = scopeId;
        }
      }
      out.candidateTotal = matched;
    }

    const cap = Math.min(req.scanCap || 0, all.length);
    for (let i = 0; i < cap; i++) addElement(all[i], true);

    return out;
  }

  function startFiber(loc) {
    const start = loc.start || {};
    if (start.kind === 'anchor') {
      let el = null;
      try { el = document.querySelector(start.selector); } catch (_) { el = null; }
      return fiberOf(el);
    }
    if (start.kind === 'root') return fiberOf(rootElement());
    if (start.kind === 'scan') return fiberOf(document.querySelectorAll('*')[start.position]);
    return null;
  }

  function resolveStore(loc) {
    let f = startFiber(loc);
    for (let i = 0; f && i < loc.hops; i++) f = f.return;
    if (!f) return undefined;
    const holder = slot(f, loc.slot);
    if (!holder || typeof holder !== 'object') return undefined;
    return holder[loc.name];
  }

  function resolvePath(loc, path) {
    let v = resolveStore(loc);
    for (const part of String(path).split('.').filter(Boolean)) {
      if (v === null || v === undefined) return undefined;
      try { v = v[part]; } catch (_) { return undefined; }
    }
    return v;
  }

  function isArray(v) {
    return Array.isArray(v) ||
      (!!v && typeof v === 'object' && typeof v.length === 'number' && typeof v.push === 'function');
  }

  function objectId(v) {
    let id = objectIds.get(v);
    if (id === undefined) {
      id = nextObjectId++;
      objectIds.set(v, id);
    }
    return id;
  }

  function sequenceInfo(loc, path) {
    const v = resolvePath(loc, path);
    if (v === null || v === undefined || typeof v !== 'object') return { found: false, ordered: false, objectId: null };
    return { found: true, ordered: isArray(v), objectId: objectId(v) };
  }

  function emit(watchId, index, items, removed) {
    const payload = JSON.stringify({ watchId, index, added: items.map(clone), removed: removed || 0 });
    queueMicrotask(() => {
      try { window[BINDING](payload); } catch (_) {}
    });
  }

  function observeNative(loc, path, watchId) {
    const v = resolvePath(loc, path);
    if (!isArray(v)) return { ok: false, reason: 'not an ordered collection' };
    const observe = typeof v.observe === 'function' ? v.observe
      : typeof v.observe_ === 'function' ? v.observe_ : null;
    if (!observe) return { ok: false, reason: 'no change subscription' };
    try {
      const dispose = observe.call(v, (change) => {
        if (change && change.type === 'splice' && change.addedCount > 0) {
          emit(watchId, change.index, Array.from(change.added || []), change.removedCount);
        }
      });
      disposers.set(watchId, typeof dispose === 'function' ? dispose : () => {});
      return { ok: true };
    } catch (e) {
      return { ok: false, reason: String(e) };
    }
  }

  function unobserve(watchId) {
    const d = disposers.get(watchId);
    disposers.delete(watchId);
    if (d) { try { d(); } catch (_) {} }
    return !!d;
  }

  function interceptAppend(loc, path, watchId) {
    const v = resolvePath(loc, path);
    if (!isArray(v)) return { ok: false, reason: 'not an ordered collection' };
    if (Object.isFrozen(v)) return { ok: false, reason: 'collection is frozen' };
    const original = v.push;
    const wrapped = function (...items) {
      const start = this.length;
      const result = original.apply(this, items);
      try { emit(watchId, start, items, 0); } catch (_) {}
      return result;
    };
    try {
      v.push = wrapped;
    } catch (e) {
      return { ok: false, reason: String(e) };
    }
    if (v.push !== wrapped) return { ok: false, reason: 'push is not writable' };
    return { ok: true };
  }

  function renderReady() {
    return !!fiberOf(rootElement());
  }

  function scrollToEdge(selector, edge) {
    let el = null;
    try { el = document.querySelector(selector); } catch (_) { el = null; }
    el = el || document.scrollingElement || document.documentElement;
    el.scrollTop = edge === 'bottom' ? el.scrollHeight : 0;
    return true;
  }

  Object.defineProperty(window, '__threadHarvest', {
    value: {
      capture, sequenceInfo, observeNative, unobserve, interceptAppend, scrollToEdge, renderReady,
      clone,
    },
    enumerable: false,
  });
})();
"#
    .to_string()
}

fn call<A: Serialize + ?Sized>(function: &str, args: &[&A]) -> String {
    let args: Vec<String> = args
        .iter()
        .map(|a| serde_json::to_string(a).unwrap_or_else(|_| "null".to_string()))
        .collect();
    format!(
        "{}\n(function () {{ return JSON.stringify(window.__threadHarvest.{}({})); }})()",
        prelude(),
        function,
        args.join(", ")
    )
}

/// Returns the snapshot as a JSON string.
pub fn capture_js(request: &CaptureRequest) -> String {
    call("capture", &[request])
}

pub fn scroll_js(container: &str, edge: ScrollEdge) -> String {
    call("scrollToEdge", &[container, edge.as_str()])
}

/// `{found, ordered, objectId}` for the value at `path` inside the store.
pub fn sequence_info_js(store: &LocatedStore, path: &str) -> String {
    call2("sequenceInfo", store, path, None)
}

pub fn observe_native_js(store: &LocatedStore, path: &str, watch_id: &str) -> String {
    call2("observeNative", store, path, Some(watch_id))
}

pub fn intercept_append_js(store: &LocatedStore, path: &str, watch_id: &str) -> String {
    call2("interceptAppend", store, path, Some(watch_id))
}

pub fn unobserve_js(watch_id: &str) -> String {
    call("unobserve", &[watch_id])
}

/// `true` once the app container has a framework render node attached.
pub fn render_ready_js() -> String {
    call::<str>("renderReady", &[])
}

/// Replay locator: the store value itself is not sent back into the page.
#[derive(Serialize)]
struct StoreRef<'a> {
    name: &'a str,
    start: &'a crate::extraction::store_locator::StoreStart,
    hops: usize,
    slot: crate::extraction::snapshot::StateSlot,
}

fn call2(function: &str, store: &LocatedStore, path: &str, watch_id: Option<&str>) -> String {
    let loc = serde_json::to_string(&StoreRef {
        name: &store.name,
        start: &store.start,
        hops: store.hops,
        slot: store.slot,
    })
    .unwrap_or_else(|_| "null".to_string());
    let path = serde_json::to_string(path).unwrap_or_else(|_| "\"\"".to_string());
    let extra = watch_id
        .and_then(|w| serde_json::to_string(w).ok())
        .map(|w| format!(", {w}"))
        .unwrap_or_default();
    format!(
        "{}\n(function () {{ return JSON.stringify(window.__threadHarvest.{}({}, {}{})); }})()",
        prelude(),
        function,
        loc,
        path,
        extra
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::snapshot::StateSlot;
    use crate::extraction::store_locator::StoreStart;
    use serde_json::Value;

    #[test]
    fn test_prelude_is_guarded_and_names_binding() {
        let js = prelude();
        assert!(js.contains("if (window.__threadHarvest) return;"));
        assert!(js.contains(BINDING_NAME));
        for slot in StateSlot::ORDERED {
            assert!(js.contains(slot.js_path()));
        }
    }

    #[test]
    fn test_capture_embeds_request_as_json() {
        let req = CaptureRequest {
            anchors: vec!["[data-id=\"x\"]".into()],
            class_fragment: "msg".into(),
            max_candidates: 5,
            scan_cap: 10,
            max_depth: 20,
            keys: vec!["id".into()],
            scope: Some("#thread".into()),
        };
        let js = capture_js(&req);
        assert!(js.contains("window.__threadHarvest.capture({\"anchors\":[\"[data-id=\\\"x\\\"]\"]"));
        assert!(js.contains("\"classFragment\":\"msg\""));
        assert!(js.contains("\"scope\":\"#thread\""));
    }

    #[test]
    fn test_capture_scopes_candidates_and_counts_past_cap() {
        let js = prelude();
        assert!(js.contains("scopeEl.querySelectorAll('*')"));
        assert!(js.contains("out.elements[id].within = scopeId"));
        assert!(js.contains("out.candidateTotal = matched"));
    }

    #[test]
    fn test_chain_walk_extends_through_shorter_earlier_walks() {
        let js = prelude();
        let start = js.find("function addChain").unwrap();
        let end = js.find("function addElement").unwrap();
        let walk = &js[start..end];
        assert!(walk.contains("reach[id] >= budget"));
        assert!(!walk.contains("if (known) break;"));
    }

    #[test]
    fn test_render_ready_takes_no_arguments() {
        let js = render_ready_js();
        assert!(js.ends_with("JSON.stringify(window.__threadHarvest.renderReady()); })()"));
        assert!(prelude().contains("renderReady,"));
    }

    #[test]
    fn test_store_ref_omits_value() {
        let store = LocatedStore {
            name: "chat".into(),
            start: StoreStart::Scan { position: 3 },
            hops: 2,
            slot: StateSlot::InstanceState,
            value: serde_json::json!({"huge": [1, 2, 3]}),
        };
        let js = observe_native_js(&store, "messages", "w1");
        let marker = "window.__threadHarvest.observeNative(";
        let args = &js[js.find(marker).unwrap() + marker.len()..];
        let loc_end = args.find("}, ").unwrap() + 1;
        let loc: Value = serde_json::from_str(&args[..loc_end]).unwrap();
        assert_eq!(loc["start"]["kind"], "scan");
        assert_eq!(loc["slot"], "stateNode.state");
        assert!(loc.get("value").is_none());
        assert!(args.contains("\"messages\", \"w1\""));
    }
}
