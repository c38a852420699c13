//! Compact formatters for shapes, projections, and the loop IR.
//!
//! Output is close to the C the backend would emit, so dumps read naturally
//! next to the generated code. Used by the CLI, by `debug!` logging, and by
//! tests.

use std::fmt::Write;

use crate::array::ArrayRegistry;
use crate::indexing::{AxisIndex, Projections};
use crate::llir::{Expr, Stmt};
use crate::shape::Shape;

/// `[2]|[]->[3]` style shape rendering.
pub fn format_shape(shape: &Shape) -> String {
    format!("{}|{}->{}", shape.batch, shape.input, shape.output)
}

pub fn format_idcs(idcs: &[AxisIndex]) -> String {
    let parts: Vec<String> = idcs.iter().map(|i| i.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

pub fn format_projections(projections: &Projections) -> String {
    let mut out = String::new();
    let iters: Vec<String> = projections
        .product_iterators
        .iter()
        .zip(projections.product_space.iter())
        .map(|(s, d)| format!("{}:{}", s, d))
        .collect();
    let _ = writeln!(out, "product ({})", iters.join(", "));
    let _ = writeln!(out, "  lhs {}", format_idcs(&projections.lhs));
    for (n, rhs) in projections.rhs.iter().enumerate() {
        let _ = writeln!(out, "  rhs{} {}", n + 1, format_idcs(rhs));
    }
    out
}

/// C-like dump of a statement tree.
pub fn format_stmt(stmt: &Stmt, arrays: &ArrayRegistry) -> String {
    let mut out = String::new();
    write_stmt(&mut out, stmt, arrays, 0);
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn write_stmt(out: &mut String, stmt: &Stmt, arrays: &ArrayRegistry, depth: usize) {
    match stmt {
        Stmt::Noop => {}
        Stmt::Seq(items) => {
            for item in items {
                write_stmt(out, item, arrays, depth);
            }
        }
        Stmt::For {
            index,
            from,
            to,
            body,
            trace_it,
        } => {
            indent(out, depth);
            let tag = if *trace_it { "" } else { " /* untraced */" };
            let _ = writeln!(out, "for ({} = {}; {} <= {}; ++{}) {{{}", index, from, index, to, index, tag);
            write_stmt(out, body, arrays, depth + 1);
            indent(out, depth);
            out.push_str("}\n");
        }
        Stmt::ZeroOut(a) => {
            indent(out, depth);
            let _ = writeln!(out, "memset({}, 0);", arrays.get(*a).label);
        }
        Stmt::Set { array, idcs, value } => {
            indent(out, depth);
            let _ = writeln!(
                out,
                "{}{} = {};",
                arrays.get(*array).label,
                format_idcs(idcs),
                format_expr(value, arrays)
            );
        }
        Stmt::SetLocal(id, value) => {
            indent(out, depth);
            let _ = writeln!(out, "{} = {};", id, format_expr(value, arrays));
        }
        Stmt::Comment(text) => {
            indent(out, depth);
            let _ = writeln!(out, "/* {} */", text);
        }
        Stmt::StagedCallback { name } => {
            indent(out, depth);
            let _ = writeln!(out, "callback({});", name);
        }
    }
}

pub fn format_expr(expr: &Expr, arrays: &ArrayRegistry) -> String {
    match expr {
        Expr::Const(c) => format!("{}", c),
        Expr::Get(a, idcs) => format!("{}{}", arrays.get(*a).label, format_idcs(idcs)),
        Expr::GetLocal(id) => id.to_string(),
        Expr::GetGlobal { ident, idcs } => match idcs {
            Some(idcs) => format!("{}{}", ident, format_idcs(idcs)),
            None => ident.clone(),
        },
        Expr::EmbedIndex(idx) => format!("(float){}", idx),
        Expr::Binop(op, l, r) => {
            format!("({} {} {})", format_expr(l, arrays), op, format_expr(r, arrays))
        }
        Expr::Unop(op, x) => format!("{}({})", op, format_expr(x, arrays)),
        Expr::LocalScope { id, prec, body, .. } => {
            let mut out = String::new();
            let _ = writeln!(out, "({{ {} {};", prec, id);
            write_stmt(&mut out, body, arrays, 1);
            let _ = write!(out, "  {}; }})", id);
            out
        }
    }
}
