use good_lp::{
    default_solver, Expression, ProblemVariables, ResolutionError, Solution as _, SolverModel,
    Variable, VariableDefinition,
};
use log::*;

use crate::{BoolVar, SatConstraint, SatModel, SatSolver, Solution, SolveStatus};

/** A [`SatSolver`] backed by the [`good_lp`] mixed integer solver.

Booleans become binary variables. Integer variables are only ever
compared with each other, so they stay continuous within their bounds
and are rounded on the way out. Each constraint becomes one linear
inequality; [`SatConstraint::Precedes`] uses a big-M term so it is
vacuous when its boolean is false.

Assumptions are added as equalities first. If that makes the model
infeasible, it is solved again without them.
**/
#[derive(Debug, Default, Clone)]
pub struct LpSolver;

struct LpVars {
    bools: Vec<Variable>,
    ints: Vec<Variable>,
}

impl LpSolver {
    fn solve_with(model: &SatModel, assume: bool) -> Result<(Vec<bool>, Vec<i64>), ResolutionError> {
        let mut problem_vars = ProblemVariables::default();
        let vars = LpVars {
            bools: problem_vars.add_vector(VariableDefinition::new().binary(), model.n_bools()),
            ints: model
                .int_bounds()
                .iter()
                .map(|&(lo, hi)| problem_vars.add(VariableDefinition::new().min(lo as f64).max(hi as f64)))
                .collect(),
        };

        let mut cost: Expression = 0.into();
        for &(var, weight) in model.objective() {
            cost += vars.bools[var.index()] * weight as f64;
        }

        let mut lp = problem_vars.minimise(cost).using(default_solver);
        let sum = |vs: &[BoolVar]| -> Expression { vs.iter().map(|v| &vars.bools[v.index()]).sum() };

        for c in model.constraints() {
            match c {
                SatConstraint::ExactlyOne(vs) => {
                    lp.add_constraint(sum(vs.as_slice()).eq(1));
                }
                SatConstraint::AtMostOne(vs) => {
                    lp.add_constraint(sum(vs.as_slice()).leq(1));
                }
                SatConstraint::BoolOr { enforce, literals } => {
                    let enforce: Expression = vars.bools[enforce.index()].into();
                    lp.add_constraint(enforce.leq(sum(literals.as_slice())));
                }
                SatConstraint::Precedes {
                    enforce,
                    before,
                    after,
                } => {
                    let (_, before_hi) = model.int_bounds()[before.index()];
                    let (after_lo, _) = model.int_bounds()[after.index()];
                    let big_m = (before_hi - after_lo + 1).max(0) as f64;
                    // before + 1 <= after + M * (1 - enforce)
                    let left: Expression = Expression::from(vars.ints[before.index()])
                        + vars.bools[enforce.index()] * big_m
                        + 1.0;
                    let right: Expression = Expression::from(vars.ints[after.index()]) + big_m;
                    lp.add_constraint(left.leq(right));
                }
            }
        }

        if assume {
            for &(var, value) in model.assumptions() {
                let var: Expression = vars.bools[var.index()].into();
                lp.add_constraint(var.eq(value as i32));
            }
        }

        let solution = lp.solve()?;
        let bools = vars.bools.iter().map(|&v| solution.value(v) > 0.5).collect();
        let ints = vars.ints.iter().map(|&v| solution.value(v).round() as i64).collect();
        Ok((bools, ints))
    }
}

impl SatSolver for LpSolver {
    fn solve(&mut self, model: &SatModel) -> Solution {
        if let Err(e) = model.validate() {
            warn!("Refusing to solve: {}", e);
            return Solution::without_assignment(SolveStatus::ModelInvalid);
        }

        let mut result = Self::solve_with(model, true);
        if !model.assumptions().is_empty() && matches!(result, Err(ResolutionError::Infeasible)) {
            info!("Infeasible under {} assumptions, dropping them", model.assumptions().len());
            result = Self::solve_with(model, false);
        }

        match result {
            Ok((bools, ints)) => Solution {
                status: SolveStatus::Optimal,
                bools,
                ints,
            },
            Err(ResolutionError::Infeasible) => Solution::without_assignment(SolveStatus::Infeasible),
            Err(e) => {
                warn!("Solver failed: {}", e);
                Solution::without_assignment(SolveStatus::Unknown)
            }
        }
    }
}
