use tch::{
    nn::{self, Module},
    Kind, Tensor,
};

/// T5-style layer norm: scales by the root mean square only, with no mean subtraction and no
/// bias.
#[derive(Debug)]
pub struct T5LayerNorm {
    weight: Tensor,
    eps: f64,
}

impl T5LayerNorm {
    pub fn new(vs: nn::Path, size: i64, eps: f64) -> Self {
        let weight = vs.ones("weight", &[size]);
        Self { weight, eps }
    }
}

impl Module for T5LayerNorm {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let variance = xs
            .to_kind(Kind::Float)
            .pow_tensor_scalar(2)
            .mean_dim(-1, true, Kind::Float);
        let xs_normed = xs.to_kind(Kind::Float) * (variance + self.eps).rsqrt();
        // half-precision weights pull the activations back down with them
        let xs_normed = match self.weight.kind() {
            Kind::Half | Kind::BFloat16 => xs_normed.to_kind(self.weight.kind()),
            _ => xs_normed,
        };
        &self.weight * xs_normed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tch::{nn::VarStore, Device};

    #[test]
    fn normalizes_by_root_mean_square() {
        let vs = VarStore::new(Device::Cpu);
        let norm = T5LayerNorm::new(vs.root() / "norm", 2, 0.0);
        let out = norm.forward(&Tensor::from_slice(&[3.0f32, 4.0]).view([1, 2]));
        // rms of (3, 4) is sqrt(12.5)
        let rms = 12.5f64.sqrt();
        assert_abs_diff_eq!(out.double_value(&[0, 0]), 3.0 / rms, epsilon = 1e-5);
        assert_abs_diff_eq!(out.double_value(&[0, 1]), 4.0 / rms, epsilon = 1e-5);
    }
}
