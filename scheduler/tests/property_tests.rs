// Property-based tests for recipe invariants.
//
// Three categories:
// 1. Loop chains: print/parse roundtrip, fusion fixpoint, store preservation,
//    and cursor survival across fusion
// 2. Allocation lifting: the greedy budget walk on generated nests
// 3. Redundant loop removal: never removes more than asked
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use lsc::ast::{Stmt, StmtKind};
use lsc::cursor::Loc;
use lsc::proc::Proc;
use lsc::recipes::{autolift_alloc, fuse_all_loops, remove_redundant_loops, AutoLift};
use lsc::walk::visit_stmts;
use proptest::prelude::*;

// ── Generators ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ChainLoop {
    var: &'static str,
    hi: i64,
    nested: bool,
}

fn arb_chain() -> impl Strategy<Value = Vec<ChainLoop>> {
    let one = (
        prop_oneof![Just("i"), Just("j")],
        prop_oneof![Just(4i64), Just(8i64)],
        prop::bool::ANY,
    )
        .prop_map(|(var, hi, nested)| ChainLoop { var, hi, nested });
    prop::collection::vec(one, 1..=6)
}

/// Sibling loops, each writing only its own buffer.
fn chain_source(chain: &[ChainLoop]) -> String {
    let params: Vec<String> = (0..chain.len())
        .map(|k| format!("b{k}: i32[8] @ DRAM"))
        .collect();
    let mut src = format!("proc chain({}) {{\n", params.join(", "));
    for (k, l) in chain.iter().enumerate() {
        let v = l.var;
        let body = if l.nested {
            format!("for w in seq(0, 2) {{ b{k}[{v}] = w; }}")
        } else {
            format!("b{k}[{v}] = {k};")
        };
        src.push_str(&format!("    for {v} in seq(0, {}) {{ {body} }}\n", l.hi));
    }
    src.push_str("}\n");
    src
}

/// Loop nest with literal trips around a scalar temporary.
fn nest_source(trips: &[i64]) -> String {
    let shape: Vec<String> = trips.iter().map(|t| t.to_string()).collect();
    let vars: Vec<String> = (0..trips.len()).map(|d| format!("v{d}")).collect();
    let idx = vars.join(", ");
    let mut src = format!("proc nest(o: i32[{}] @ DRAM) {{\n", shape.join(", "));
    for (v, t) in vars.iter().zip(trips) {
        src.push_str(&format!("for {v} in seq(0, {t}) {{\n"));
    }
    src.push_str(&format!("t: i32 @ DRAM;\nt = o[{idx}];\no[{idx}] = t;\n"));
    for _ in trips {
        src.push_str("}\n");
    }
    src.push_str("}\n");
    src
}

fn stores(p: &Proc) -> Vec<&Stmt> {
    let mut out = Vec::new();
    visit_stmts(&p.def().body, &mut |s| {
        if matches!(s.kind, StmtKind::Assign(_) | StmtKind::Reduce(_)) {
            out.push(s);
        }
    });
    out
}

/// Number of maximal runs of equal (var, hi) neighbours.
fn runs(chain: &[ChainLoop]) -> usize {
    1 + chain
        .windows(2)
        .filter(|w| (w[0].var, w[0].hi) != (w[1].var, w[1].hi))
        .count()
}

// ── Loop chains ─────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn print_parse_roundtrip(chain in arb_chain()) {
        let p = Proc::parse(&chain_source(&chain)).unwrap();
        let printed = p.to_string();
        let reparsed = Proc::parse(&printed).unwrap();
        prop_assert_eq!(reparsed.to_string(), printed);
        prop_assert_eq!(reparsed.fingerprint(), p.fingerprint());
    }

    #[test]
    fn fuse_all_loops_invariants(chain in arb_chain()) {
        let p = Proc::parse(&chain_source(&chain)).unwrap();
        let captured: Vec<_> = stores(&p)
            .iter()
            .map(|s| p.cursor(Loc::Node(s.id)))
            .collect();

        let q = fuse_all_loops(&p, &p.body()[0]).unwrap();
        prop_assert_eq!(q.body().len(), runs(&chain));
        prop_assert_eq!(stores(&q).len(), chain.len());
        for c in &captured {
            let moved = q.forward(c);
            prop_assert!(moved.is_ok(), "lost {:?}", c);
            prop_assert_eq!(moved.unwrap().id(), c.id());
        }

        let again = fuse_all_loops(&q, &q.body()[0]).unwrap();
        prop_assert_eq!(again.fingerprint(), q.fingerprint());
    }
}

// ── Allocation lifting ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn autolift_takes_greedy_innermost_suffix(
        trips in prop::collection::vec(1i64..=6, 1..=4),
        budget in 0i64..300,
    ) {
        let p = Proc::parse(&nest_source(&trips)).unwrap();
        let q = autolift_alloc(&p, &p.find_alloc("t").unwrap(), &AutoLift::new(budget)).unwrap();

        let mut expected = 1;
        for t in trips.iter().rev() {
            if expected * t > budget {
                break;
            }
            expected *= t;
        }
        let alloc = q.find_alloc("t").unwrap();
        let count = alloc.stmt().and_then(Stmt::as_alloc).and_then(|a| a.decl.element_count());
        prop_assert_eq!(count, Some(expected));
        prop_assert!(expected == 1 || expected <= budget);
    }

    #[test]
    fn remove_redundant_loops_never_exceeds_num(
        trips in prop::collection::vec(1i64..=4, 1..=4),
        num in 0usize..6,
    ) {
        // The store depends only on the innermost variable.
        let depth = trips.len();
        let mut src = String::from("proc f(a: i32[4] @ DRAM) {\n");
        for (d, t) in trips.iter().enumerate() {
            src.push_str(&format!("for v{d} in seq(0, {t}) {{\n"));
        }
        src.push_str("for k in seq(0, 4) { a[k] = 3; }\n");
        for _ in 0..depth {
            src.push_str("}\n");
        }
        src.push_str("}\n");
        let p = Proc::parse(&src).unwrap();
        let store = p.find_loop("k").unwrap().body()[0].clone();

        let (q, removed) = remove_redundant_loops(&p, &store, num).unwrap();
        prop_assert!(removed <= num);
        prop_assert_eq!(removed, num.min(depth));
        prop_assert!(q.forward(&store).is_ok());
    }
}
