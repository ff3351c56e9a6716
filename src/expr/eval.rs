//! Vector evaluation of a parsed program.
//!
//! Every value is a vector of f64. Binary operations work element-wise; a
//! length-1 operand broadcasts against the other side.

use hashbrown::HashMap;

use crate::{Error, Result};
use super::ast::*;

type Vector = Vec<f64>;

/// Run `program` with input `x`. `out_len` sizes `y` for element assignments.
pub fn evaluate(program: &Program, x: &[f64], out_len: usize) -> Result<Vector> {
    let mut locals: HashMap<&str, Vector> = HashMap::new();
    let mut y: Option<Vector> = None;

    for stmt in &program.statements {
        let value = eval_expr(&stmt.expr, x, &locals)?;
        match &stmt.target {
            Target::Output => y = Some(value),
            Target::OutputElement(i) => {
                let out = y.get_or_insert_with(|| vec![0.0; out_len.max(1)]);
                let slot = out.get_mut(*i).ok_or_else(|| {
                    Error::Expression(format!("y[{i}] is out of range for length {out_len}"))
                })?;
                *slot = scalar(&value, "y[i]")?;
            }
            Target::Local(name) => {
                locals.insert(name.as_str(), value);
            }
        }
    }

    let mut y = y.ok_or_else(|| Error::Expression("output 'y' was never assigned".into()))?;
    if y.len() == 1 && out_len > 1 {
        y = vec![y[0]; out_len];
    }
    Ok(y)
}

fn scalar(v: &[f64], what: &str) -> Result<f64> {
    match v {
        [single] => Ok(*single),
        _ => Err(Error::Expression(format!("{what} needs a scalar, got length {}", v.len()))),
    }
}

fn eval_expr(expr: &Expr, x: &[f64], locals: &HashMap<&str, Vector>) -> Result<Vector> {
    match expr {
        Expr::Number(n) => Ok(vec![*n]),
        Expr::Input => Ok(x.to_vec()),
        Expr::InputElement(i) => x.get(*i).map(|v| vec![*v]).ok_or_else(|| {
            Error::Expression(format!("x[{i}] is out of range for length {}", x.len()))
        }),
        Expr::Variable(name) => locals
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| Error::Expression(format!("variable '{name}' is not set"))),
        Expr::Unary { op, expr } => {
            let v = eval_expr(expr, x, locals)?;
            Ok(match op {
                UnaryOp::Negate => v.into_iter().map(|a| -a).collect(),
                UnaryOp::Not => v.into_iter().map(|a| truth(a == 0.0)).collect(),
            })
        }
        Expr::Binary { left, op, right } => {
            let l = eval_expr(left, x, locals)?;
            let r = eval_expr(right, x, locals)?;
            zip(&l, &r, |a, b| apply_binary(*op, a, b))
        }
        Expr::Conditional { cond, then, otherwise } => {
            let c = eval_expr(cond, x, locals)?;
            let t = eval_expr(then, x, locals)?;
            let e = eval_expr(otherwise, x, locals)?;
            let n = broadcast_len(&[c.len(), t.len(), e.len()])?;
            let at = |v: &[f64], i: usize| if v.len() == 1 { v[0] } else { v[i] };
            Ok((0..n).map(|i| if at(&c, i) != 0.0 { at(&t, i) } else { at(&e, i) }).collect())
        }
        Expr::Call { func, args } => {
            let a = eval_expr(&args[0], x, locals)?;
            let f: fn(f64) -> f64 = match func {
                Function::Pow | Function::Min | Function::Max => {
                    let b = eval_expr(&args[1], x, locals)?;
                    let g: fn(f64, f64) -> f64 = match func {
                        Function::Pow => f64::powf,
                        Function::Min => f64::min,
                        _ => f64::max,
                    };
                    return zip(&a, &b, g);
                }
                Function::Abs => f64::abs,
                Function::Sqrt => f64::sqrt,
                Function::Floor => f64::floor,
                Function::Ceil => f64::ceil,
                Function::Round => f64::round,
                Function::Sin => f64::sin,
                Function::Cos => f64::cos,
                Function::Tan => f64::tan,
                Function::Exp => f64::exp,
                Function::Log => f64::ln,
            };
            Ok(a.into_iter().map(f).collect())
        }
    }
}

fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn apply_binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Mod => a % b,
        BinaryOp::Pow => a.powf(b),
        BinaryOp::Eq => truth(a == b),
        BinaryOp::Neq => truth(a != b),
        BinaryOp::Lt => truth(a < b),
        BinaryOp::Lte => truth(a <= b),
        BinaryOp::Gt => truth(a > b),
        BinaryOp::Gte => truth(a >= b),
        BinaryOp::And => truth(a != 0.0 && b != 0.0),
        BinaryOp::Or => truth(a != 0.0 || b != 0.0),
    }
}

/// Common length of operands that are either that length or scalar.
fn broadcast_len(lens: &[usize]) -> Result<usize> {
    let n = lens.iter().copied().max().unwrap_or(1);
    if lens.iter().all(|&l| l == n || l == 1) {
        Ok(n)
    } else {
        Err(Error::Expression(format!("vector length mismatch: {lens:?}")))
    }
}

/// Element-wise combination with scalar broadcasting.
fn zip(l: &[f64], r: &[f64], f: impl Fn(f64, f64) -> f64) -> Result<Vector> {
    let n = broadcast_len(&[l.len(), r.len()])?;
    let at = |v: &[f64], i: usize| if v.len() == 1 { v[0] } else { v[i] };
    Ok((0..n).map(|i| f(at(l, i), at(r, i))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{lexer::tokenize, parser::parse};

    fn run(src: &str, x: &[f64], out_len: usize) -> Result<Vec<f64>> {
        let program = parse(&tokenize(src)?, 64)?;
        evaluate(&program, x, out_len)
    }

    #[test]
    fn test_scale() {
        assert_eq!(run("y=x*100", &[3.0], 1).unwrap(), vec![300.0]);
    }

    #[test]
    fn test_vector_broadcast() {
        assert_eq!(run("y = x + 1", &[1.0, 2.0, 3.0], 3).unwrap(), vec![2.0, 3.0, 4.0]);
        assert_eq!(run("y = 7", &[0.0], 3).unwrap(), vec![7.0, 7.0, 7.0]);
    }

    #[test]
    fn test_element_assignment() {
        let out = run("y[1] = x[0] * 2; y[0] = -1", &[4.0, 9.0], 2).unwrap();
        assert_eq!(out, vec![-1.0, 8.0]);
        assert!(run("y[5] = 1", &[0.0], 2).is_err());
    }

    #[test]
    fn test_conditional_and_functions() {
        assert_eq!(run("y = x > 2 ? 10 : 20", &[1.0, 3.0], 2).unwrap(), vec![20.0, 10.0]);
        assert_eq!(run("y = max(abs(x), 2)", &[-5.0, 1.0], 2).unwrap(), vec![5.0, 2.0]);
        assert_eq!(run("y = floor(x) + round(0.6)", &[2.7], 1).unwrap(), vec![3.0]);
    }

    #[test]
    fn test_locals() {
        assert_eq!(run("k = x * 2; y = k + k", &[1.5], 1).unwrap(), vec![6.0]);
    }

    #[test]
    fn test_length_mismatch() {
        assert_eq!(zip(&[1.0, 2.0], &[3.0], |a, b| a + b).unwrap(), vec![4.0, 5.0]);
        assert!(matches!(zip(&[1.0, 2.0], &[1.0, 2.0, 3.0], |a, b| a + b), Err(Error::Expression(_))));
        assert!(matches!(run("y = x[2]", &[1.0], 1), Err(Error::Expression(_))));
    }
}
