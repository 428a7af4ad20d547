use apteryx_core::TrainingArguments;
use tch::{COptimizer, Kind, TchError, Tensor};

/// AdamW over a fixed set of parameters, with optional global-norm gradient clipping.
pub struct Optimizer {
    optimizer: COptimizer,
    parameters: Vec<Tensor>,
    clip_grad_norm: Option<f64>,
}

impl Optimizer {
    /// Only `parameters` are updated; pass the trainable ones.
    pub fn adamw(parameters: Vec<Tensor>, args: &TrainingArguments) -> Result<Self, TchError> {
        let mut optimizer = COptimizer::adamw(
            args.learning_rate,
            args.adam_beta1,
            args.adam_beta2,
            args.weight_decay,
            args.adam_epsilon,
            false,
        )?;
        for tensor in &parameters {
            optimizer.add_parameters(tensor, 0)?;
        }
        let clip_grad_norm = match args.max_grad_norm {
            x if x > 0.0 => Some(x),
            _ => None,
        };
        Ok(Self {
            optimizer,
            parameters,
            clip_grad_norm,
        })
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters.len()
    }

    /// Global L2 norm of every defined gradient.
    pub fn grad_norm(&self) -> Result<f64, TchError> {
        let norms = self
            .parameters
            .iter()
            .filter_map(|parameter| {
                let grad = parameter.grad();
                grad.defined().then(|| grad.to_kind(Kind::Float).norm())
            })
            .collect::<Vec<_>>();
        if norms.is_empty() {
            return Ok(0.0);
        }
        Tensor::stack(&norms, 0).norm().f_double_value(&[])
    }

    /// Rescales gradients so their global norm is at most `max_norm`. Returns the norm before
    /// clipping.
    pub fn clip_grad_norm(&self, max_norm: f64) -> Result<f64, TchError> {
        let total_norm = self.grad_norm()?;
        if total_norm > max_norm {
            let scale = max_norm / (total_norm + 1e-6);
            for parameter in &self.parameters {
                let mut grad = parameter.grad();
                if grad.defined() {
                    let _ = grad.g_mul_scalar_(scale);
                }
            }
        }
        Ok(total_norm)
    }

    /// Clips, applies one update at `lr` and clears the gradients. Returns the pre-clip norm
    /// when clipping is on.
    pub fn step(&mut self, lr: f64) -> Result<Option<f64>, TchError> {
        let norm = match self.clip_grad_norm {
            Some(max_norm) => Some(self.clip_grad_norm(max_norm)?),
            None => None,
        };
        self.optimizer.set_learning_rate(lr)?;
        self.optimizer.step()?;
        self.optimizer.zero_grad()?;
        Ok(norm)
    }

    pub fn zero_grad(&mut self) -> Result<(), TchError> {
        self.optimizer.zero_grad()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;
    use tch::Device;

    fn args(max_grad_norm: f64) -> TrainingArguments {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut args = TrainingArguments::defaults_for("t5-small", date);
        args.max_grad_norm = max_grad_norm;
        args.learning_rate = 0.1;
        args.weight_decay = 0.0;
        args
    }

    fn parameter_with_grad(grad: &[f32]) -> Tensor {
        let parameter = Tensor::zeros([grad.len() as i64], (Kind::Float, Device::Cpu))
            .set_requires_grad(true);
        let loss = (&parameter * Tensor::from_slice(grad)).sum(Kind::Float);
        loss.backward();
        parameter
    }

    #[test]
    fn clipping_scales_to_max_norm() {
        let parameter = parameter_with_grad(&[3.0, 4.0]);
        let optimizer = Optimizer::adamw(vec![parameter.shallow_clone()], &args(1.0)).unwrap();
        let norm = optimizer.clip_grad_norm(1.0).unwrap();
        assert_abs_diff_eq!(norm, 5.0, epsilon = 1e-5);
        assert_abs_diff_eq!(optimizer.grad_norm().unwrap(), 1.0, epsilon = 1e-4);
    }

    #[test]
    fn step_moves_parameters_and_clears_grads() {
        let parameter = parameter_with_grad(&[1.0, -1.0]);
        let mut optimizer = Optimizer::adamw(vec![parameter.shallow_clone()], &args(0.0)).unwrap();
        assert_eq!(optimizer.step(0.1).unwrap(), None);
        // adam's first step moves by lr in the direction opposite to the gradient sign
        assert_abs_diff_eq!(parameter.double_value(&[0]), -0.1, epsilon = 1e-4);
        assert_abs_diff_eq!(parameter.double_value(&[1]), 0.1, epsilon = 1e-4);
        assert_abs_diff_eq!(optimizer.grad_norm().unwrap(), 0.0, epsilon = 1e-8);
    }
}
