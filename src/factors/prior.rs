//! Gaussian priors produced by marginalization and consensus updates.

use nalgebra::{DMatrix, DVector};

use crate::state::{FrameId, ParamBlockId, ParamKind};

use super::{box_minus, Manifold};

/// Eigenvalues below this are treated as the gauge nullspace of the prior.
const EIGEN_EPS: f64 = 1e-8;

/// One kept parameter of a marginalization prior.
#[derive(Debug, Clone)]
pub struct PriorParam {
    /// Arena handle of the live block this prior constrains.
    pub block: ParamBlockId,
    pub kind: ParamKind,
    /// Owning frame, when the block belongs to one (pose, speed-bias).
    pub frame: Option<FrameId>,
    pub manifold: Manifold,
    /// Ambient linearization point x₀ captured at marginalization time.
    pub x0: Vec<f64>,
    /// Tangent-space offset of this block inside the prior.
    pub index: usize,
}

/// Prior factor over the kept parameters of a marginalized subproblem.
///
/// Holds the square-root information `L` (so `LᵀL = A`) and the constant
/// residual part `e₀ = L⁻ᵀ b`; the residual at the current estimate is
/// `L · (x ⊟ x₀) + e₀`.
#[derive(Debug, Clone)]
pub struct PriorFactor {
    params: Vec<PriorParam>,
    sqrt_info: DMatrix<f64>,
    linear_res: DVector<f64>,
}

impl PriorFactor {
    /// Build from the condensed normal equations (A, b) of a Schur
    /// complement. Rank deficiency in A (the gauge directions) maps to zero
    /// rows of L, which simply contribute nothing to the residual.
    pub fn new(params: Vec<PriorParam>, a: &DMatrix<f64>, b: &DVector<f64>) -> Self {
        let n = a.nrows();
        assert_eq!(a.ncols(), n);
        assert_eq!(b.len(), n);

        let a_sym = 0.5 * (a + a.transpose());
        let eigen = nalgebra::SymmetricEigen::new(a_sym);

        let mut sqrt_s = DVector::zeros(n);
        let mut inv_sqrt_s = DVector::zeros(n);
        for i in 0..n {
            let s = eigen.eigenvalues[i];
            if s > EIGEN_EPS {
                sqrt_s[i] = s.sqrt();
                inv_sqrt_s[i] = 1.0 / s.sqrt();
            }
        }

        let vt = eigen.eigenvectors.transpose();
        let sqrt_info = DMatrix::from_diagonal(&sqrt_s) * &vt;
        let linear_res = DMatrix::from_diagonal(&inv_sqrt_s) * &vt * b;

        Self {
            params,
            sqrt_info,
            linear_res,
        }
    }

    pub fn residual_size(&self) -> usize {
        self.sqrt_info.nrows()
    }

    /// Kept parameters, in tangent-index order.
    pub fn params(&self) -> &[PriorParam] {
        &self.params
    }

    /// Residual from the ambient blocks of the kept parameters, in the same
    /// order as `params()`.
    pub fn residual(&self, params: &[&[f64]]) -> DVector<f64> {
        let n = self.sqrt_info.nrows();
        let mut dx = DVector::zeros(n);
        let mut buf = [0.0_f64; 16];
        for (info, values) in self.params.iter().zip(params.iter()) {
            let t = info.manifold.tangent_size();
            box_minus(&info.manifold, values, &info.x0, &mut buf[..t]);
            for j in 0..t {
                dx[info.index + j] = buf[j];
            }
        }
        &self.sqrt_info * dx + &self.linear_res
    }

    /// Information matrix reconstructed from the square root (tests and
    /// chained marginalization diagnostics).
    pub fn information(&self) -> DMatrix<f64> {
        self.sqrt_info.transpose() * &self.sqrt_info
    }
}

/// Scalar-weighted prior pulling a single pose block toward a target.
///
/// This is the augmented-Lagrangian consensus term of the distributed solver:
/// residual `√ρ · (x ⊟ target)`.
#[derive(Debug, Clone)]
pub struct PosePriorFactor {
    target: Vec<f64>,
    weight: f64,
    manifold: Manifold,
}

impl PosePriorFactor {
    pub fn new(target: Vec<f64>, weight: f64, manifold: Manifold) -> Self {
        Self {
            target,
            weight,
            manifold,
        }
    }

    pub fn residual_size(&self) -> usize {
        self.manifold.tangent_size()
    }

    pub fn residual(&self, params: &[&[f64]]) -> DVector<f64> {
        let t = self.manifold.tangent_size();
        let mut out = DVector::zeros(t);
        let mut buf = [0.0_f64; 8];
        box_minus(&self.manifold, params[0], &self.target, &mut buf[..t]);
        for j in 0..t {
            out[j] = self.weight * buf[j];
        }
        out
    }
}
