//! Lowering tapes to portable C source
//!
//! The generated code is self-contained apart from `math.h`: every work slot
//! becomes a local scalar declared at its first write, and output pointers
//! are null-checked so callers can skip results they do not need.
use crate::{compiler::Tape, compiler::TapeOp, Error};
use std::collections::{BTreeSet, HashSet};
use std::fmt::Write;

/// Helper functions that the generated code may require
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum Helper {
    Square,
    Sign,
}

/// Accumulates one or more tapes into a single C translation unit
pub struct CodeGenerator {
    real_type: String,
    helpers: BTreeSet<Helper>,
    body: String,
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGenerator {
    /// Builds a generator emitting `double` arithmetic
    pub fn new() -> Self {
        Self::with_real_type("double")
    }

    /// Builds a generator emitting the given scalar type, e.g. `float`
    pub fn with_real_type(real_type: &str) -> Self {
        Self {
            real_type: real_type.to_owned(),
            helpers: BTreeSet::new(),
            body: String::new(),
        }
    }

    /// Appends a function for the given tape.
    ///
    /// The signature is `void {fname}(const T* x0, ..., T* r0, ...)` with one
    /// pointer per declared input and output.  Tapes with free variables
    /// cannot be lowered.
    pub fn add(&mut self, fname: &str, tape: &Tape) -> Result<(), Error> {
        if !tape.free_vars().is_empty() {
            return Err(Error::FreeVariables {
                function: tape.name().to_owned(),
                vars: tape.free_vars().to_vec(),
            });
        }
        for op in tape.iter() {
            match op {
                TapeOp::Unary {
                    op: crate::context::UnaryOpcode::Square,
                    ..
                } => {
                    self.helpers.insert(Helper::Square);
                }
                TapeOp::Unary {
                    op: crate::context::UnaryOpcode::Sign,
                    ..
                } => {
                    self.helpers.insert(Helper::Sign);
                }
                _ => (),
            }
        }

        let t = &self.real_type;
        let mut args: Vec<String> = (0..tape.input_sizes().len())
            .map(|i| format!("const {t}* x{i}"))
            .collect();
        args.extend(
            (0..tape.output_sizes().len()).map(|o| format!("{t}* r{o}")),
        );
        let signature = format!("void {fname}({}) {{\n", args.join(", "));
        self.body.push_str(&signature);

        let mut declared: HashSet<usize> = HashSet::new();
        let line = |declared: &mut HashSet<usize>,
                    dst: usize,
                    expr: String|
         -> String {
            if declared.insert(dst) {
                format!("  {t} a{dst} = {expr};\n")
            } else {
                format!("  a{dst} = {expr};\n")
            }
        };
        for op in tape.iter() {
            let text = match op {
                TapeOp::Input { dst, arg, offset } => line(
                    &mut declared,
                    *dst,
                    format!("x{arg}[{offset}]"),
                ),
                TapeOp::Output { out, offset, src } => {
                    format!("  if (r{out}!=0) r{out}[{offset}] = a{src};\n")
                }
                TapeOp::Const { dst, value } => {
                    line(&mut declared, *dst, float_literal(*value))
                }
                TapeOp::Param { .. } => unreachable!(),
                TapeOp::Unary { dst, op, arg } => {
                    let (pre, post) = op.tokens();
                    line(&mut declared, *dst, format!("{pre}a{arg}{post}"))
                }
                TapeOp::Binary { dst, op, lhs, rhs } => {
                    let (pre, sep, post) = op.tokens();
                    line(
                        &mut declared,
                        *dst,
                        format!("{pre}a{lhs}{sep}a{rhs}{post}"),
                    )
                }
            };
            self.body.push_str(&text);
        }
        self.body.push_str("}\n\n");
        Ok(())
    }

    /// Renders the full translation unit
    pub fn finish(self) -> String {
        let t = &self.real_type;
        let mut out = String::from("#include <math.h>\n\n");
        for helper in &self.helpers {
            match helper {
                Helper::Square => {
                    let _ = writeln!(
                        out,
                        "static {t} sq({t} x) {{ return x*x; }}"
                    );
                }
                Helper::Sign => {
                    let _ = writeln!(
                        out,
                        "static {t} sign({t} x) {{ return x>0 ? 1 : \
                         (x<0 ? -1 : x); }}"
                    );
                }
            }
        }
        if !self.helpers.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.body);
        out
    }
}

/// Formats an `f64` as a C literal that round-trips exactly
fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "NAN".to_owned()
    } else if v == f64::INFINITY {
        "INFINITY".to_owned()
    } else if v == f64::NEG_INFINITY {
        "-INFINITY".to_owned()
    } else {
        format!("{v:?}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{eval::Options, Context};

    fn sample_tape() -> Tape {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let xy = ctx.mul(x, y).unwrap();
        let s = ctx.sin(x).unwrap();
        let z = ctx.add(xy, s).unwrap();
        Tape::new(
            &ctx,
            "f",
            &[vec![x], vec![y]],
            &[vec![z]],
            &Options::default(),
        )
        .unwrap()
    }

    #[test]
    fn generates_guarded_c_source() {
        let mut gen = CodeGenerator::new();
        gen.add("f", &sample_tape()).unwrap();
        let src = gen.finish();
        assert!(src.starts_with("#include <math.h>\n"));
        assert!(src
            .contains("void f(const double* x0, const double* x1, double* r0)"));
        assert!(src.contains("sin("));
        assert!(src.contains("if (r0!=0) r0[0] = "));
        // Slots are reused, so redeclaration must not happen
        assert_eq!(src.matches("double a0 =").count(), 1);
    }

    #[test]
    fn helpers_are_emitted_once() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let a = ctx.square(x).unwrap();
        let b = ctx.sign(x).unwrap();
        let z = ctx.add(a, b).unwrap();
        let tape = Tape::new(
            &ctx,
            "g",
            &[vec![x]],
            &[vec![z]],
            &Options::default(),
        )
        .unwrap();
        let mut gen = CodeGenerator::new();
        gen.add("g1", &tape).unwrap();
        gen.add("g2", &tape).unwrap();
        let src = gen.finish();
        assert_eq!(src.matches("static double sq(").count(), 1);
        assert_eq!(src.matches("static double sign(").count(), 1);
        assert!(src.contains("void g1("));
        assert!(src.contains("void g2("));
    }

    #[test]
    fn constants_round_trip() {
        assert_eq!(float_literal(2.5), "2.5");
        assert_eq!(float_literal(1e-7), "1e-7");
        assert_eq!(float_literal(f64::NAN), "NAN");
        assert_eq!(float_literal(f64::NEG_INFINITY), "-INFINITY");
    }

    #[test]
    fn free_variables_are_rejected() {
        let mut ctx = Context::new();
        let x = ctx.var("x");
        let y = ctx.var("y");
        let z = ctx.mul(x, y).unwrap();
        let tape = Tape::new(
            &ctx,
            "f",
            &[vec![x]],
            &[vec![z]],
            &Options::default(),
        )
        .unwrap();
        let mut gen = CodeGenerator::new();
        assert!(matches!(
            gen.add("f", &tape),
            Err(Error::FreeVariables { .. })
        ));
    }

    #[test]
    fn float_real_type() {
        let mut gen = CodeGenerator::with_real_type("float");
        gen.add("f", &sample_tape()).unwrap();
        let src = gen.finish();
        assert!(src.contains("void f(const float* x0"));
        assert!(src.contains("float a0 ="));
    }
}
