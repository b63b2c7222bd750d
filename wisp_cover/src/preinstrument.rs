//! Branch pre-instrumentation.
//!
//! Rewrites a source tree so that every control-flow decision leaves a
//! bytecode-visible trace: each edge gets a synthetic assignment
//!
//! ```text
//! _wispcover_branch = (source_line, destination_line)
//! ```
//!
//! placed at the start of the code the edge enters. A destination of 0
//! means the edge leaves the enclosing scope. Marker statements and
//! their sub-expressions carry line 0, so the line instrumenter never
//! selects them as line-probe sites; the bytecode editor later finds
//! the `LoadConst` + `StoreGlobal` pairs and swaps them for branch
//! probes.
//!
//! The sentinel is declared `global` at the top of every function body
//! so markers always compile to `StoreGlobal`, never to a local store.
//!
//! Branch constructs for this host: `if`, `while`, and `for`, each
//! with a body edge and an else/exit edge. `try` bodies and handlers
//! only participate in successor-line computation.

use wisp_host::ast::{Constant, Expr, ExprKind, Module, Stmt, StmtKind};

/// Name of the synthetic branch sentinel.
pub const BRANCH_NAME: &str = "_wispcover_branch";

/// Insert branch markers throughout a module.
pub fn preinstrument(mut module: Module) -> Module {
    walk_stmts(&mut module.body, 0);
    module
}

/// Build one marker statement; every node carries line 0.
fn marker(src_line: u32, dst_line: u32) -> Stmt {
    let pair = Expr::new(
        ExprKind::Tuple(vec![
            Expr::new(ExprKind::Constant(Constant::Int(src_line as i64)), 0),
            Expr::new(ExprKind::Constant(Constant::Int(dst_line as i64)), 0),
        ]),
        0,
    );
    Stmt::new(
        StmtKind::Assign {
            name: BRANCH_NAME.into(),
            value: pair,
        },
        0,
    )
}

/// Process a statement list whose execution continues at line
/// `next_after` (0 = leaves the scope).
fn walk_stmts(stmts: &mut [Stmt], next_after: u32) {
    let successors: Vec<u32> = (0..stmts.len())
        .map(|i| stmts.get(i + 1).map_or(next_after, |s| s.line))
        .collect();

    for (stmt, next) in stmts.iter_mut().zip(successors) {
        walk_stmt(stmt, next);
    }
}

fn walk_stmt(stmt: &mut Stmt, next: u32) {
    let line = stmt.line;
    match &mut stmt.kind {
        StmtKind::If { body, orelse, .. } => {
            mark_arms(line, body, orelse, next);
            walk_stmts(body, next);
            walk_stmts(orelse, next);
        }

        StmtKind::While { body, orelse, .. } | StmtKind::For { body, orelse, .. } => {
            mark_arms(line, body, orelse, next);
            // The loop body's last statement continues at the loop head.
            walk_stmts(body, line);
            walk_stmts(orelse, next);
        }

        StmtKind::Try { body, handlers } => {
            walk_stmts(body, next);
            for handler in handlers {
                walk_stmts(&mut handler.body, next);
            }
        }

        StmtKind::FunctionDef { body, .. } => {
            body.insert(0, Stmt::new(StmtKind::Global(vec![BRANCH_NAME.into()]), 0));
            walk_stmts(body, 0);
        }

        _ => {}
    }
}

/// Insert the taken-edge marker into `body` and the else/exit-edge
/// marker into `orelse`.
fn mark_arms(line: u32, body: &mut Vec<Stmt>, orelse: &mut Vec<Stmt>, next: u32) {
    if let Some(first) = body.first() {
        let dst = first.line;
        body.insert(0, marker(line, dst));
    }
    match orelse.first() {
        Some(first) => {
            let dst = first.line;
            orelse.insert(0, marker(line, dst));
        }
        None => orelse.push(marker(line, next)),
    }
}
