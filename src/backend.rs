//! Pluggable tape execution backends
//!
//! A [`Backend`] owns whatever state it needs to run a compiled [`Tape`]
//! repeatedly.  The portable interpreter is always available; accelerator
//! backends are looked up by name so that callers degrade gracefully when a
//! build does not include them.
use crate::{
    compiler::Tape,
    eval::run_forward,
    Error,
};

/// A tape execution engine
pub trait Backend {
    /// Prepares the backend to run the given tape.
    ///
    /// May be called again to swap in a different tape.
    fn compile(&mut self, tape: &Tape) -> Result<(), Error>;

    /// Runs the most recently compiled tape
    fn execute(
        &mut self,
        inputs: &[&[f64]],
        outputs: &mut [Vec<f64>],
    ) -> Result<(), Error>;

    /// Frees the compiled tape and any associated resources.
    ///
    /// Idempotent; also called on drop.
    fn release(&mut self);
}

/// Looks up an execution backend by name.
///
/// Only `"interpreter"` is available in this build.
pub fn create(name: &str) -> Result<Box<dyn Backend>, Error> {
    match name {
        "interpreter" => Ok(Box::<Interpreter>::default()),
        other => Err(Error::BackendUnavailable(other.to_owned())),
    }
}

/// The portable single-threaded interpreter backend
#[derive(Default)]
pub struct Interpreter {
    tape: Option<Tape>,
    work: Vec<f64>,
}

impl Backend for Interpreter {
    fn compile(&mut self, tape: &Tape) -> Result<(), Error> {
        if !tape.free_vars().is_empty() {
            return Err(Error::FreeVariables {
                function: tape.name().to_owned(),
                vars: tape.free_vars().to_vec(),
            });
        }
        self.work = vec![f64::NAN; tape.worksize()];
        self.tape = Some(tape.clone());
        log::debug!(
            "interpreter backend compiled `{}` ({} instructions)",
            tape.name(),
            tape.len()
        );
        Ok(())
    }

    fn execute(
        &mut self,
        inputs: &[&[f64]],
        outputs: &mut [Vec<f64>],
    ) -> Result<(), Error> {
        let tape = self.tape.as_ref().ok_or(Error::BackendNotReady)?;
        let in_sizes = tape.input_sizes();
        if inputs.len() != in_sizes.len() {
            return Err(Error::BadSlice(inputs.len(), in_sizes.len()));
        }
        for (given, &expected) in inputs.iter().zip(in_sizes) {
            if given.len() != expected {
                return Err(Error::BadSlice(given.len(), expected));
            }
        }
        let out_sizes = tape.output_sizes();
        if outputs.len() != out_sizes.len() {
            return Err(Error::BadSlice(outputs.len(), out_sizes.len()));
        }
        for (given, &expected) in outputs.iter().zip(out_sizes) {
            if given.len() != expected {
                return Err(Error::BadSlice(given.len(), expected));
            }
        }
        run_forward(tape.ops(), &mut self.work, inputs, outputs);
        Ok(())
    }

    fn release(&mut self) {
        self.tape = None;
        self.work = vec![];
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.release();
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
    fn interpreter_matches_direct_evaluation() {
        let tape = sample_tape();
        let mut backend = create("interpreter").unwrap();
        backend.compile(&tape).unwrap();
        let mut out = vec![vec![0.0]];
        backend.execute(&[&[2.0], &[3.0]], &mut out).unwrap();
        assert_eq!(out[0][0], 6.0 + 2.0_f64.sin());
    }

    #[test]
    fn unknown_backend_name() {
        let Err(err) = create("opencl") else {
            panic!("opencl backend is not compiled in");
        };
        assert!(matches!(err, Error::BackendUnavailable(name) if name == "opencl"));
    }

    #[test]
    fn execute_requires_compile() {
        let mut backend = create("interpreter").unwrap();
        let mut out = vec![vec![0.0]];
        let err = backend.execute(&[&[1.0]], &mut out).unwrap_err();
        assert!(matches!(err, Error::BackendNotReady));
    }

    #[test]
    fn release_is_idempotent() {
        let tape = sample_tape();
        let mut backend = create("interpreter").unwrap();
        backend.compile(&tape).unwrap();
        backend.release();
        backend.release();
        let mut out = vec![vec![0.0]];
        assert!(matches!(
            backend.execute(&[&[2.0], &[3.0]], &mut out),
            Err(Error::BackendNotReady)
        ));
    }
}
