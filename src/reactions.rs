//! Reaction evaluators: given the species concentrations at one location, produce the
//! reaction contribution to `dc/dt` at that location.

use crate::error::{PixelSimError, Result};
use log::{debug, warn};
use meval::{ContextProvider, Expr, FuncEvalError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Evaluates reaction rates at a single location.
///
/// `evaluate` overwrites `output` (one entry per species, in the configured species order)
/// from `input` (same ordering). It is called concurrently from worker threads, each with
/// its own buffers.
pub trait ReactionEvaluator: Send + Sync {
    fn evaluate(&self, output: &mut [f64], input: &[f64]);

    /// As `evaluate`, for rates that may depend on simulated time or voxel position.
    fn evaluate_at(&self, output: &mut [f64], input: &[f64], _location: &Location) {
        self.evaluate(output, input)
    }
}

/// Simulated time and physical voxel position seen by a reaction as the variables
/// `time`, `x`, `y` and `z`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Location {
    pub time: f64,
    pub position: [f64; 3],
}

/// No reactions: every rate is zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReactions;

impl ReactionEvaluator for NoReactions {
    fn evaluate(&self, output: &mut [f64], _input: &[f64]) {
        output.fill(0.0);
    }
}

/// Wraps a closure `f(output, input)`.
pub struct FnEvaluator<F>(pub F);

impl<F> ReactionEvaluator for FnEvaluator<F>
where
    F: Fn(&mut [f64], &[f64]) + Send + Sync,
{
    fn evaluate(&self, output: &mut [f64], input: &[f64]) {
        (self.0)(output, input)
    }
}

/// Multiplies every output of another evaluator by a constant factor.
pub struct ScaledEvaluator {
    inner: Arc<dyn ReactionEvaluator>,
    factor: f64,
}

impl ReactionEvaluator for ScaledEvaluator {
    fn evaluate(&self, output: &mut [f64], input: &[f64]) {
        self.inner.evaluate(output, input);
        output.iter_mut().for_each(|o| *o *= self.factor);
    }

    fn evaluate_at(&self, output: &mut [f64], input: &[f64], location: &Location) {
        self.inner.evaluate_at(output, input, location);
        output.iter_mut().for_each(|o| *o *= self.factor);
    }
}

/// One reaction: a rate expression and the species it consumes/produces.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionDef {
    pub id: String,
    pub expression: String,
    /// (species id, stoichiometric coefficient); negative for reactants.
    pub stoichiometry: Vec<(String, f64)>,
}

impl ReactionDef {
    pub fn new(id: &str, expression: &str, stoichiometry: &[(&str, f64)]) -> Self {
        ReactionDef {
            id: id.to_string(),
            expression: expression.to_string(),
            stoichiometry: stoichiometry.iter().map(|(s, c)| (s.to_string(), *c)).collect(),
        }
    }
}

thread_local! {
    static BUILTINS: meval::Context<'static> = meval::Context::new();
}

/// Variable lookup for one evaluation: species by position, then parameters, then
/// time and position, then builtins.
struct LocalContext<'a> {
    species_ids: &'a [String],
    concentrations: &'a [f64],
    parameters: &'a BTreeMap<String, f64>,
    location: Location,
}

impl ContextProvider for LocalContext<'_> {
    fn get_var(&self, name: &str) -> Option<f64> {
        if let Some(i) = self.species_ids.iter().position(|s| s == name) {
            return self.concentrations.get(i).copied();
        }
        if let Some(v) = self.parameters.get(name) {
            return Some(*v);
        }
        match name {
            "time" => return Some(self.location.time),
            "x" => return Some(self.location.position[0]),
            "y" => return Some(self.location.position[1]),
            "z" => return Some(self.location.position[2]),
            _ => {}
        }
        BUILTINS.with(|ctx| ctx.get_var(name))
    }

    fn eval_func(&self, name: &str, args: &[f64]) -> std::result::Result<f64, FuncEvalError> {
        BUILTINS.with(|ctx| ctx.eval_func(name, args))
    }
}

struct CompiledReaction {
    expr: Expr,
    /// (species index, scale * stoichiometric coefficient)
    coefficients: Vec<(usize, f64)>,
}

/// Reaction terms compiled from rate expressions:
/// `dc_s/dt = scale * sum_r stoich[r][s] * rate_r(c)`.
pub struct ExpressionEvaluator {
    species_ids: Vec<String>,
    parameters: BTreeMap<String, f64>,
    reactions: Vec<CompiledReaction>,
}

impl ExpressionEvaluator {
    /// Compiles `reactions` over the ordered `species_ids`. Stoichiometry entries for species
    /// outside `species_ids` are ignored.
    pub fn new(
        species_ids: &[String],
        reactions: &[ReactionDef],
        scale: f64,
        parameters: &BTreeMap<String, f64>,
    ) -> Result<Self> {
        let mut compiled = Vec::with_capacity(reactions.len());
        for r in reactions {
            let expr: Expr = r.expression.parse().map_err(|e: meval::Error| PixelSimError::Expression {
                expression: r.expression.clone(),
                message: e.to_string(),
            })?;
            // evaluate once to catch unknown variables and functions now rather than per voxel
            let ones = vec![1.0; species_ids.len()];
            let ctx = LocalContext {
                species_ids,
                concentrations: &ones,
                parameters,
                location: Location::default(),
            };
            expr.eval_with_context(ctx).map_err(|e| PixelSimError::Expression {
                expression: r.expression.clone(),
                message: e.to_string(),
            })?;
            let mut coefficients = Vec::new();
            for (s, coef) in &r.stoichiometry {
                match species_ids.iter().position(|id| id == s) {
                    Some(i) => coefficients.push((i, scale * coef)),
                    None => warn!("reaction '{}': species '{}' is not available here, ignoring", r.id, s),
                }
            }
            debug!("  - reaction '{}': {}", r.id, r.expression);
            compiled.push(CompiledReaction { expr, coefficients });
        }
        Ok(ExpressionEvaluator {
            species_ids: species_ids.to_vec(),
            parameters: parameters.clone(),
            reactions: compiled,
        })
    }
}

impl ReactionEvaluator for ExpressionEvaluator {
    fn evaluate(&self, output: &mut [f64], input: &[f64]) {
        self.evaluate_at(output, input, &Location::default());
    }

    fn evaluate_at(&self, output: &mut [f64], input: &[f64], location: &Location) {
        output.fill(0.0);
        for r in &self.reactions {
            let ctx = LocalContext {
                species_ids: &self.species_ids,
                concentrations: input,
                parameters: &self.parameters,
                location: *location,
            };
            // failures surface as NaN and are caught by the error estimate
            let rate = r.expr.eval_with_context(ctx).unwrap_or(f64::NAN);
            for &(i, coef) in &r.coefficients {
                output[i] += coef * rate;
            }
        }
    }
}

/// Where the reaction terms of a compartment or membrane come from.
#[derive(Clone, Default)]
pub enum ReactionTerms {
    #[default]
    None,
    /// Rate expressions, compiled over the location's species list.
    Expressions(Vec<ReactionDef>),
    /// A ready-made evaluator over the location's species list.
    Custom(Arc<dyn ReactionEvaluator>),
}

impl fmt::Debug for ReactionTerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactionTerms::None => write!(f, "None"),
            ReactionTerms::Expressions(r) => f.debug_tuple("Expressions").field(r).finish(),
            ReactionTerms::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl ReactionTerms {
    pub fn is_empty(&self) -> bool {
        match self {
            ReactionTerms::None => true,
            ReactionTerms::Expressions(r) => r.is_empty(),
            ReactionTerms::Custom(_) => false,
        }
    }

    /// Builds the evaluator over `species_ids`, with every term multiplied by `scale`.
    pub fn build(
        &self,
        species_ids: &[String],
        scale: f64,
        parameters: &BTreeMap<String, f64>,
    ) -> Result<Arc<dyn ReactionEvaluator>> {
        Ok(match self {
            ReactionTerms::None => Arc::new(NoReactions),
            ReactionTerms::Expressions(r) => Arc::new(ExpressionEvaluator::new(species_ids, r, scale, parameters)?),
            ReactionTerms::Custom(inner) if scale == 1.0 => Arc::clone(inner),
            ReactionTerms::Custom(inner) => Arc::new(ScaledEvaluator { inner: Arc::clone(inner), factor: scale }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(s: &[&str]) -> Vec<String> {
        s.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn mass_action_with_parameters() {
        let mut params = BTreeMap::new();
        params.insert("k".to_string(), 0.5);
        let r = ReactionDef::new("r1", "k * a * b", &[("a", -1.0), ("b", -1.0), ("c", 1.0)]);
        let eval = ExpressionEvaluator::new(&ids(&["a", "b", "c"]), &[r], 2.0, &params).unwrap();
        let mut out = vec![9.0; 3];
        eval.evaluate(&mut out, &[2.0, 3.0, 0.0]);
        // rate = 3, scaled by 2
        assert_eq!(out, vec![-6.0, -6.0, 6.0]);
    }

    #[test]
    fn builtin_functions_are_available() {
        let r = ReactionDef::new("decay", "exp(0) * 2 * x", &[("x", -1.0)]);
        let eval = ExpressionEvaluator::new(&ids(&["x"]), &[r], 1.0, &BTreeMap::new()).unwrap();
        let mut out = vec![0.0];
        eval.evaluate(&mut out, &[1.5]);
        assert!((out[0] + 3.0).abs() < 1e-12);
    }

    #[test]
    fn time_and_position_are_variables() {
        let r = ReactionDef::new("source", "time + 10 * x + 100 * y + 1000 * z", &[("u", 1.0)]);
        let eval = ExpressionEvaluator::new(&ids(&["u"]), &[r], 2.0, &BTreeMap::new()).unwrap();
        let mut out = vec![0.0];
        let at = Location { time: 0.5, position: [1.0, 2.0, 3.0] };
        eval.evaluate_at(&mut out, &[0.0], &at);
        assert_eq!(out[0], 2.0 * 3210.5);
        // without a location, everything is at the origin at t = 0
        eval.evaluate(&mut out, &[0.0]);
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn species_and_parameters_shadow_coordinates() {
        let mut params = BTreeMap::new();
        params.insert("y".to_string(), 7.0);
        let r = ReactionDef::new("r", "x + y", &[("x", 1.0)]);
        let eval = ExpressionEvaluator::new(&ids(&["x"]), &[r], 1.0, &params).unwrap();
        let mut out = vec![0.0];
        eval.evaluate_at(&mut out, &[1.0], &Location { time: 0.0, position: [100.0, 100.0, 0.0] });
        assert_eq!(out[0], 8.0);
    }

    #[test]
    fn unknown_variable_is_a_configuration_error() {
        let r = ReactionDef::new("bad", "k * x", &[("x", -1.0)]);
        let err = ExpressionEvaluator::new(&ids(&["x"]), &[r], 1.0, &BTreeMap::new())
            .err()
            .unwrap();
        assert!(matches!(err, PixelSimError::Expression { .. }));
    }

    #[test]
    fn parse_error_is_reported() {
        let r = ReactionDef::new("bad", "x * (", &[("x", -1.0)]);
        assert!(ExpressionEvaluator::new(&ids(&["x"]), &[r], 1.0, &BTreeMap::new()).is_err());
    }

    #[test]
    fn custom_terms_are_scaled() {
        let terms = ReactionTerms::Custom(Arc::new(FnEvaluator(|out: &mut [f64], inp: &[f64]| {
            out[0] = inp[0];
        })));
        let eval = terms.build(&ids(&["x"]), 3.0, &BTreeMap::new()).unwrap();
        let mut out = vec![0.0];
        eval.evaluate(&mut out, &[2.0]);
        assert_eq!(out[0], 6.0);
        let none = ReactionTerms::None.build(&ids(&["x"]), 3.0, &BTreeMap::new()).unwrap();
        none.evaluate(&mut out, &[2.0]);
        assert_eq!(out[0], 0.0);
    }
}
