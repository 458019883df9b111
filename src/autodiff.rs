// Reverse-mode automatic differentiation over 2-D `f32` arrays.
// A `Tape` records every value it produces together with the operation that produced it.
// Nodes are only ever appended, and an operation can only refer to nodes that already exist, so
// walking the tape backwards visits every node after all of its consumers.

use crate::error::TensorError;
use ndarray::{Array2, Axis};

// Handle to a node on a `Tape`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var(usize);

#[derive(Debug, Clone, Copy)]
enum Op {
    Leaf,
    MatMul(Var, Var),
    Mul(Var, Var),
    Sub(Var, Var),
    Relu(Var),
    Exp(Var),
    Log(Var),
    SumRows(Var),
    Sum(Var),
    Scale(Var, f32),
}

#[derive(Debug)]
struct Node {
    value: Array2<f32>,
    op: Op,
}

#[derive(Debug, Default)]
pub struct Tape {
    nodes: Vec<Node>,
}

impl Tape {
    pub fn new() -> Tape {
        Tape::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, value: Array2<f32>, op: Op) -> Var {
        self.nodes.push(Node { value, op });
        Var(self.nodes.len() - 1)
    }

    pub fn value(&self, var: Var) -> &Array2<f32> {
        &self.nodes[var.0].value
    }

    fn shape(&self, var: Var) -> (usize, usize) {
        self.value(var).dim()
    }

    // Elementwise binary operations require identical shapes; no broadcasting is performed.
    fn same_shape(&self, op: &'static str, a: Var, b: Var) -> Result<(), TensorError> {
        let (lhs, rhs) = (self.shape(a), self.shape(b));
        if lhs == rhs {
            Ok(())
        } else {
            Err(TensorError::ShapeMismatch { op, lhs, rhs })
        }
    }

    // Record an input value. Leaves have no parents and accumulate gradient like any other node.
    pub fn leaf(&mut self, value: Array2<f32>) -> Var {
        self.push(value, Op::Leaf)
    }

    pub fn matmul(&mut self, a: Var, b: Var) -> Result<Var, TensorError> {
        let (lhs, rhs) = (self.shape(a), self.shape(b));
        if lhs.1 != rhs.0 {
            return Err(TensorError::ShapeMismatch {
                op: "matmul",
                lhs,
                rhs,
            });
        }
        let value = self.value(a).dot(self.value(b));
        Ok(self.push(value, Op::MatMul(a, b)))
    }

    pub fn mul(&mut self, a: Var, b: Var) -> Result<Var, TensorError> {
        self.same_shape("mul", a, b)?;
        let value = self.value(a) * self.value(b);
        Ok(self.push(value, Op::Mul(a, b)))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Result<Var, TensorError> {
        self.same_shape("sub", a, b)?;
        let value = self.value(a) - self.value(b);
        Ok(self.push(value, Op::Sub(a, b)))
    }

    pub fn relu(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(|x| x.max(0.0));
        self.push(value, Op::Relu(a))
    }

    pub fn exp(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f32::exp);
        self.push(value, Op::Exp(a))
    }

    pub fn log(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(f32::ln);
        self.push(value, Op::Log(a))
    }

    // Sum across each row, giving an `(n, 1)` column.
    pub fn sum_rows(&mut self, a: Var) -> Var {
        let value = self.value(a).sum_axis(Axis(1)).insert_axis(Axis(1));
        self.push(value, Op::SumRows(a))
    }

    // Sum every element into a `1x1` node.
    pub fn sum(&mut self, a: Var) -> Var {
        let value = Array2::from_elem((1, 1), self.value(a).sum());
        self.push(value, Op::Sum(a))
    }

    pub fn scale(&mut self, a: Var, factor: f32) -> Var {
        let value = self.value(a) * factor;
        self.push(value, Op::Scale(a, factor))
    }

    // Differentiate the `1x1` node `output` with respect to every node recorded before it.
    pub fn backward(&self, output: Var) -> Result<Gradients, TensorError> {
        let shape = self.shape(output);
        if shape != (1, 1) {
            return Err(TensorError::NotScalar(shape));
        }

        let mut grads: Vec<Option<Array2<f32>>> = vec![None; output.0 + 1];
        grads[output.0] = Some(Array2::ones((1, 1)));

        for index in (0..=output.0).rev() {
            // Nodes the output never consumed have no gradient to pass on.
            let Some(grad) = grads[index].take() else {
                continue;
            };
            let node = &self.nodes[index];

            match node.op {
                Op::Leaf => {}
                Op::MatMul(a, b) => {
                    accumulate(&mut grads, a, grad.dot(&self.value(b).t()));
                    accumulate(&mut grads, b, self.value(a).t().dot(&grad));
                }
                Op::Mul(a, b) => {
                    accumulate(&mut grads, a, &grad * self.value(b));
                    accumulate(&mut grads, b, &grad * self.value(a));
                }
                Op::Sub(a, b) => {
                    accumulate(&mut grads, b, -&grad);
                    accumulate(&mut grads, a, grad.clone());
                }
                Op::Relu(a) => {
                    let mask = self.value(a).mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
                    accumulate(&mut grads, a, &grad * &mask);
                }
                // d/dx exp(x) is the node's own value.
                Op::Exp(a) => accumulate(&mut grads, a, &grad * &node.value),
                Op::Log(a) => accumulate(&mut grads, a, &grad / self.value(a)),
                Op::SumRows(a) => {
                    let spread = grad.broadcast(self.shape(a)).map(|view| view.to_owned());
                    match spread {
                        Some(spread) => accumulate(&mut grads, a, spread),
                        None => {
                            return Err(TensorError::ShapeMismatch {
                                op: "sum_rows",
                                lhs: grad.dim(),
                                rhs: self.shape(a),
                            });
                        }
                    }
                }
                Op::Sum(a) => {
                    accumulate(&mut grads, a, Array2::from_elem(self.shape(a), grad[[0, 0]]))
                }
                Op::Scale(a, factor) => accumulate(&mut grads, a, &grad * factor),
            }

            grads[index] = Some(grad);
        }

        Ok(Gradients { grads })
    }
}

fn accumulate(grads: &mut [Option<Array2<f32>>], var: Var, contribution: Array2<f32>) {
    match &mut grads[var.0] {
        Some(existing) => *existing += &contribution,
        slot => *slot = Some(contribution),
    }
}

// Gradients of one output with respect to the nodes of the tape that produced it.
#[derive(Debug)]
pub struct Gradients {
    grads: Vec<Option<Array2<f32>>>,
}

impl Gradients {
    pub fn get(&self, var: Var) -> Option<&Array2<f32>> {
        self.grads.get(var.0).and_then(Option::as_ref)
    }

    pub fn wrt(&self, var: Var) -> Result<&Array2<f32>, TensorError> {
        self.get(var).ok_or(TensorError::NoGradient(var.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    // Central finite difference of a scalar function of one matrix.
    fn numerical_grad(f: impl Fn(&Array2<f32>) -> f32, at: &Array2<f32>) -> Array2<f32> {
        let eps = 1e-2;
        let mut grad = Array2::zeros(at.dim());
        for ((i, j), g) in grad.indexed_iter_mut() {
            let mut plus = at.clone();
            plus[[i, j]] += eps;
            let mut minus = at.clone();
            minus[[i, j]] -= eps;
            *g = (f(&plus) - f(&minus)) / (2.0 * eps);
        }
        grad
    }

    fn assert_close(a: &Array2<f32>, b: &Array2<f32>, tol: f32) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn matmul_forward_and_backward() {
        let mut tape = Tape::new();
        let a = tape.leaf(array![[1.0, 2.0], [3.0, 4.0]]);
        let b = tape.leaf(array![[5.0, 6.0], [7.0, 8.0]]);
        let c = tape.matmul(a, b).unwrap();
        assert_eq!(tape.value(c), &array![[19.0, 22.0], [43.0, 50.0]]);

        let total = tape.sum(c);
        let grads = tape.backward(total).unwrap();
        // d(sum(AB))/dA = 1 * B^T, summed along rows.
        assert_eq!(grads.wrt(a).unwrap(), &array![[11.0, 15.0], [11.0, 15.0]]);
        assert_eq!(grads.wrt(b).unwrap(), &array![[4.0, 4.0], [6.0, 6.0]]);
    }

    #[test]
    fn two_layer_gradients_match_finite_differences() {
        let x = array![[0.5, -1.0, 2.0], [1.5, 0.3, -0.7]];
        let w1 = array![[0.2, -0.4], [0.7, 0.1], [-0.3, 0.5]];
        let w2 = array![[0.6, -0.2, 0.1], [-0.5, 0.4, 0.3]];

        let forward = |x: &Array2<f32>, w1: &Array2<f32>, w2: &Array2<f32>| {
            let mut tape = Tape::new();
            let x = tape.leaf(x.clone());
            let w1 = tape.leaf(w1.clone());
            let w2 = tape.leaf(w2.clone());
            let z1 = tape.matmul(x, w1).unwrap();
            let a1 = tape.relu(z1);
            let z2 = tape.matmul(a1, w2).unwrap();
            let e = tape.exp(z2);
            let s = tape.sum_rows(e);
            let l = tape.log(s);
            let out = tape.sum(l);
            (tape, w1, w2, out)
        };

        let (tape, w1_var, w2_var, out) = forward(&x, &w1, &w2);
        let grads = tape.backward(out).unwrap();

        let expected_w1 = numerical_grad(|w| {
            let (tape, _, _, out) = forward(&x, w, &w2);
            tape.value(out)[[0, 0]]
        }, &w1);
        let expected_w2 = numerical_grad(|w| {
            let (tape, _, _, out) = forward(&x, &w1, w);
            tape.value(out)[[0, 0]]
        }, &w2);

        assert_close(grads.wrt(w1_var).unwrap(), &expected_w1, 1e-2);
        assert_close(grads.wrt(w2_var).unwrap(), &expected_w2, 1e-2);
    }

    #[test]
    fn reused_nodes_accumulate() {
        let mut tape = Tape::new();
        let a = tape.leaf(array![[3.0]]);
        let sq = tape.mul(a, a).unwrap();
        let diff = tape.sub(sq, a).unwrap();
        let grads = tape.backward(diff).unwrap();
        // d(a^2 - a)/da = 2a - 1
        assert_eq!(grads.wrt(a).unwrap(), &array![[5.0]]);
    }

    #[test]
    fn relu_blocks_negative_inputs() {
        let mut tape = Tape::new();
        let a = tape.leaf(array![[-1.0, 2.0]]);
        let r = tape.relu(a);
        let s = tape.sum(r);
        let scaled = tape.scale(s, 3.0);
        let grads = tape.backward(scaled).unwrap();
        assert_eq!(tape.value(scaled), &array![[6.0]]);
        assert_eq!(grads.wrt(a).unwrap(), &array![[0.0, 3.0]]);
    }

    #[test]
    fn rejects_shape_mismatch() {
        let mut tape = Tape::new();
        let a = tape.leaf(Array2::zeros((2, 3)));
        let b = tape.leaf(Array2::zeros((2, 3)));
        assert_eq!(
            tape.matmul(a, b),
            Err(TensorError::ShapeMismatch {
                op: "matmul",
                lhs: (2, 3),
                rhs: (2, 3)
            })
        );

        let c = tape.leaf(Array2::zeros((3, 2)));
        assert!(matches!(
            tape.mul(a, c),
            Err(TensorError::ShapeMismatch { op: "mul", .. })
        ));
        // Failed operations record nothing.
        assert_eq!(tape.len(), 3);
    }

    #[test]
    fn backward_needs_scalar_output() {
        let mut tape = Tape::new();
        let a = tape.leaf(Array2::zeros((2, 2)));
        assert_eq!(
            tape.backward(a).unwrap_err(),
            TensorError::NotScalar((2, 2))
        );
    }

    #[test]
    fn unrelated_nodes_have_no_gradient() {
        let mut tape = Tape::new();
        let a = tape.leaf(array![[1.0]]);
        let unused = tape.leaf(array![[2.0]]);
        let out = tape.exp(a);
        let grads = tape.backward(out).unwrap();
        assert!(grads.get(unused).is_none());
        assert_eq!(grads.wrt(unused), Err(TensorError::NoGradient(1)));
        assert!((grads.wrt(a).unwrap()[[0, 0]] - 1.0f32.exp()).abs() < 1e-6);
    }
}
