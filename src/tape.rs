//! Reverse-mode differentiation on 2-D fields.
//!
//! Operations are recorded on a [`Tape`] during the forward pass and
//! replayed in reverse by [`Tape::backward`].  Built-in operations carry
//! their own vector-Jacobian products; [`CustomFunction`] lets a caller
//! supply a hand-written backward rule that is dispatched exactly like
//! the built-ins.
//!
//! Scalars are 1×1 fields.  A tape is built for a single evaluation and
//! dropped afterwards; nothing is reused across calls.

use crate::types::InversionError;
use ndarray::{s, Array2};
use std::fmt::Debug;
use std::ops::Range;

/// Handle to a node on a [`Tape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(usize);

impl Var {
    pub fn id(self) -> usize {
        self.0
    }
}

// ─────────────────────────────────────────────────────────────
//  Custom operations  (hand-written backward rule)
// ─────────────────────────────────────────────────────────────

/// Operation with an explicit forward value and backward rule.
///
/// `backward` receives the upstream gradient of the output and the input
/// values, and returns one entry per input: `Some(grad)` with the input's
/// shape, or `None` when the input receives no gradient.
pub trait CustomFunction: Debug {
    fn name(&self) -> &'static str;

    fn forward(&self, inputs: &[&Array2<f64>]) -> Array2<f64>;

    fn backward(
        &self,
        grad_output: &Array2<f64>,
        inputs: &[&Array2<f64>],
    ) -> Vec<Option<Array2<f64>>>;
}

// ─────────────────────────────────────────────────────────────
//  Recorded operations
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Op {
    /// Registered input or constant.
    Leaf,
    Add(Var, Var),
    Sub(Var, Var),
    /// Element-wise product.
    Mul(Var, Var),
    /// out = c · a
    Scale(Var, f64),
    /// out = a + c
    Offset(Var, f64),
    /// out = max(a, 0)
    Relu(Var),
    /// out = min(a, c)
    ClampMax(Var, f64),
    /// out = a^p
    Powi(Var, i32),
    /// out = a[rows, cols]
    Window { input: Var, rows: Range<usize>, cols: Range<usize> },
    /// out = zeros(shape); out[offset..] = a
    Embed { input: Var, row_offset: usize, col_offset: usize },
    /// out = Σ a  (1×1)
    Sum(Var),
    Custom { inputs: Vec<Var>, function: Box<dyn CustomFunction> },
}

#[derive(Debug)]
struct Node {
    value: Array2<f64>,
    op: Op,
}

// ─────────────────────────────────────────────────────────────
//  The tape
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Tape {
    nodes: Vec<Node>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, value: Array2<f64>, op: Op) -> Var {
        self.nodes.push(Node { value, op });
        Var(self.nodes.len() - 1)
    }

    /// Register a field.  Inputs and constants are both leaves; only the
    /// caller decides which leaf's gradient it reads.
    pub fn leaf(&mut self, value: Array2<f64>) -> Var {
        self.push(value, Op::Leaf)
    }

    pub fn constant(&mut self, value: Array2<f64>) -> Var {
        self.leaf(value)
    }

    pub fn value(&self, v: Var) -> &Array2<f64> {
        &self.nodes[v.0].value
    }

    pub fn shape(&self, v: Var) -> (usize, usize) {
        self.nodes[v.0].value.dim()
    }

    /// Value of a 1×1 node.
    pub fn scalar(&self, v: Var) -> f64 {
        self.nodes[v.0].value[[0, 0]]
    }

    // ── Element-wise ───────────────────────────────────────

    fn check_same(&self, a: Var, b: Var, what: &str) -> Result<(), InversionError> {
        if self.shape(a) != self.shape(b) {
            return Err(InversionError::Shape(format!(
                "{what}: operands {:?} and {:?}",
                self.shape(a),
                self.shape(b)
            )));
        }
        Ok(())
    }

    pub fn add(&mut self, a: Var, b: Var) -> Result<Var, InversionError> {
        self.check_same(a, b, "add")?;
        let value = self.value(a) + self.value(b);
        Ok(self.push(value, Op::Add(a, b)))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Result<Var, InversionError> {
        self.check_same(a, b, "sub")?;
        let value = self.value(a) - self.value(b);
        Ok(self.push(value, Op::Sub(a, b)))
    }

    pub fn mul(&mut self, a: Var, b: Var) -> Result<Var, InversionError> {
        self.check_same(a, b, "mul")?;
        let value = self.value(a) * self.value(b);
        Ok(self.push(value, Op::Mul(a, b)))
    }

    /// Multiply by a constant field (masks).
    pub fn mul_const(&mut self, a: Var, mask: Array2<f64>) -> Result<Var, InversionError> {
        let c = self.constant(mask);
        self.mul(a, c)
    }

    pub fn scale(&mut self, a: Var, c: f64) -> Var {
        let value = self.value(a) * c;
        self.push(value, Op::Scale(a, c))
    }

    pub fn offset(&mut self, a: Var, c: f64) -> Var {
        let value = self.value(a) + c;
        self.push(value, Op::Offset(a, c))
    }

    pub fn relu(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(|x| x.max(0.0));
        self.push(value, Op::Relu(a))
    }

    pub fn clamp_max(&mut self, a: Var, c: f64) -> Var {
        let value = self.value(a).mapv(|x| x.min(c));
        self.push(value, Op::ClampMax(a, c))
    }

    pub fn powi(&mut self, a: Var, p: i32) -> Var {
        let value = self.value(a).mapv(|x| x.powi(p));
        self.push(value, Op::Powi(a, p))
    }

    pub fn square(&mut self, a: Var) -> Var {
        self.powi(a, 2)
    }

    // ── Structural ─────────────────────────────────────────

    /// Rectangular sub-window `a[rows, cols]`.
    pub fn window(&mut self, a: Var, rows: Range<usize>, cols: Range<usize>) -> Result<Var, InversionError> {
        let (nr, nc) = self.shape(a);
        if rows.start > rows.end || cols.start > cols.end || rows.end > nr || cols.end > nc {
            return Err(InversionError::Shape(format!(
                "window {rows:?}×{cols:?} outside field of shape ({nr}, {nc})"
            )));
        }
        let value = self.value(a).slice(s![rows.clone(), cols.clone()]).to_owned();
        Ok(self.push(value, Op::Window { input: a, rows, cols }))
    }

    /// Place `a` into a zero field of `shape` at the given offset.
    pub fn embed(
        &mut self,
        a: Var,
        shape: (usize, usize),
        row_offset: usize,
        col_offset: usize,
    ) -> Result<Var, InversionError> {
        let (nr, nc) = self.shape(a);
        if row_offset + nr > shape.0 || col_offset + nc > shape.1 {
            return Err(InversionError::Shape(format!(
                "cannot embed ({nr}, {nc}) at ({row_offset}, {col_offset}) into {shape:?}"
            )));
        }
        let mut value = Array2::zeros(shape);
        value
            .slice_mut(s![row_offset..row_offset + nr, col_offset..col_offset + nc])
            .assign(self.value(a));
        Ok(self.push(value, Op::Embed { input: a, row_offset, col_offset }))
    }

    pub fn sum(&mut self, a: Var) -> Var {
        let total = self.value(a).sum();
        self.push(Array2::from_elem((1, 1), total), Op::Sum(a))
    }

    /// Σ a²
    pub fn sum_squares(&mut self, a: Var) -> Var {
        let sq = self.square(a);
        self.sum(sq)
    }

    /// Record a [`CustomFunction`] applied to `inputs`.
    pub fn apply_custom<F>(&mut self, function: F, inputs: &[Var]) -> Var
    where
        F: CustomFunction + 'static,
    {
        let value = {
            let values: Vec<&Array2<f64>> = inputs.iter().map(|&v| self.value(v)).collect();
            function.forward(&values)
        };
        self.push(
            value,
            Op::Custom { inputs: inputs.to_vec(), function: Box::new(function) },
        )
    }

    // ── Backward pass ──────────────────────────────────────

    /// Replay the tape in reverse from the scalar `loss`.
    pub fn backward(&self, loss: Var) -> Result<Gradients, InversionError> {
        if self.shape(loss) != (1, 1) {
            return Err(InversionError::Propagation(format!(
                "loss must be scalar, got shape {:?}",
                self.shape(loss)
            )));
        }

        let mut grads: Vec<Option<Array2<f64>>> = vec![None; self.nodes.len()];
        grads[loss.0] = Some(Array2::ones((1, 1)));

        for idx in (0..=loss.0).rev() {
            let Some(d_out) = grads[idx].take() else { continue };
            let node = &self.nodes[idx];
            match &node.op {
                Op::Leaf => {
                    grads[idx] = Some(d_out);
                    continue;
                }
                Op::Add(a, b) => {
                    accumulate(&mut grads, *a, d_out.clone());
                    accumulate(&mut grads, *b, d_out);
                }
                Op::Sub(a, b) => {
                    accumulate(&mut grads, *b, -&d_out);
                    accumulate(&mut grads, *a, d_out);
                }
                Op::Mul(a, b) => {
                    accumulate(&mut grads, *a, &d_out * self.value(*b));
                    accumulate(&mut grads, *b, &d_out * self.value(*a));
                }
                Op::Scale(a, c) => accumulate(&mut grads, *a, d_out * *c),
                Op::Offset(a, _) => accumulate(&mut grads, *a, d_out),
                Op::Relu(a) => {
                    let mut d = d_out;
                    d.zip_mut_with(self.value(*a), |g, &x| {
                        if x <= 0.0 {
                            *g = 0.0;
                        }
                    });
                    accumulate(&mut grads, *a, d);
                }
                Op::ClampMax(a, c) => {
                    let mut d = d_out;
                    d.zip_mut_with(self.value(*a), |g, &x| {
                        if x > *c {
                            *g = 0.0;
                        }
                    });
                    accumulate(&mut grads, *a, d);
                }
                Op::Powi(a, p) => {
                    let p = *p;
                    let mut d = d_out;
                    d.zip_mut_with(self.value(*a), |g, &x| {
                        *g *= f64::from(p) * x.powi(p - 1);
                    });
                    accumulate(&mut grads, *a, d);
                }
                Op::Window { input, rows, cols } => {
                    let mut d = Array2::zeros(self.shape(*input));
                    d.slice_mut(s![rows.clone(), cols.clone()]).assign(&d_out);
                    accumulate(&mut grads, *input, d);
                }
                Op::Embed { input, row_offset, col_offset } => {
                    let (nr, nc) = self.shape(*input);
                    let d = d_out
                        .slice(s![*row_offset..row_offset + nr, *col_offset..col_offset + nc])
                        .to_owned();
                    accumulate(&mut grads, *input, d);
                }
                Op::Sum(a) => {
                    let g = d_out[[0, 0]];
                    accumulate(&mut grads, *a, Array2::from_elem(self.shape(*a), g));
                }
                Op::Custom { inputs, function } => {
                    let values: Vec<&Array2<f64>> = inputs.iter().map(|&v| self.value(v)).collect();
                    let input_grads = function.backward(&d_out, &values);
                    if input_grads.len() != inputs.len() {
                        return Err(InversionError::Propagation(format!(
                            "{} returned {} gradients for {} inputs",
                            function.name(),
                            input_grads.len(),
                            inputs.len()
                        )));
                    }
                    for (&input, grad) in inputs.iter().zip(input_grads) {
                        let Some(grad) = grad else { continue };
                        if grad.dim() != self.shape(input) {
                            return Err(InversionError::Propagation(format!(
                                "{} returned gradient of shape {:?} for input of shape {:?}",
                                function.name(),
                                grad.dim(),
                                self.shape(input)
                            )));
                        }
                        accumulate(&mut grads, input, grad);
                    }
                }
            }
        }

        Ok(Gradients { grads })
    }
}

fn accumulate(grads: &mut [Option<Array2<f64>>], v: Var, g: Array2<f64>) {
    match grads[v.0].as_mut() {
        Some(existing) => *existing += &g,
        None => grads[v.0] = Some(g),
    }
}

// ─────────────────────────────────────────────────────────────
//  Gradients
// ─────────────────────────────────────────────────────────────

/// Accumulated leaf gradients after [`Tape::backward`].
#[derive(Debug)]
pub struct Gradients {
    grads: Vec<Option<Array2<f64>>>,
}

impl Gradients {
    /// Gradient of the loss w.r.t. `v`; `None` if nothing flowed to it.
    pub fn get(&self, v: Var) -> Option<&Array2<f64>> {
        self.grads.get(v.0).and_then(|g| g.as_ref())
    }

    /// Gradient of the loss w.r.t. `v`, zeros when nothing flowed.
    pub fn wrt(&self, tape: &Tape, v: Var) -> Array2<f64> {
        self.get(v).cloned().unwrap_or_else(|| Array2::zeros(tape.shape(v)))
    }
}
