// Properties both lowerings must keep on the reference solver

use letsmodel::domain::{n_ary_if, Evaluator};
use letsmodel::{
    CpAdapter, Expression, MipAdapter, Model, ModelError, ReferenceSolver, Solution,
    SolverConfig, SolverService, VariableType,
};
use proptest::prelude::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn solve_mip(model: &Model) -> letsmodel::domain::Result<Solution<'_>> {
    MipAdapter::new(model, ReferenceSolver::new(), SolverConfig::default())?.solve()
}

fn solve_cp(model: &Model) -> letsmodel::domain::Result<Solution<'_>> {
    CpAdapter::new(model, ReferenceSolver::new(), SolverConfig::default())?.solve()
}

const RELATIONS: [&str; 6] = ["<", "<=", ">", ">=", "==", "!="];

fn relate(relation: usize, lhs: Expression, rhs: f64) -> Expression {
    match relation {
        0 => lhs.lt(rhs),
        1 => lhs.leq(rhs),
        2 => lhs.gt(rhs),
        3 => lhs.geq(rhs),
        4 => lhs.equals(rhs),
        _ => lhs.not_equals(rhs),
    }
}

fn holds(relation: usize, lhs: f64, rhs: f64) -> bool {
    match relation {
        0 => lhs < rhs,
        1 => lhs <= rhs,
        2 => lhs > rhs,
        3 => lhs >= rhs,
        4 => lhs == rhs,
        _ => lhs != rhs,
    }
}

#[test]
fn sequences_are_permutations_in_both_lowerings() {
    init_logging();
    for length in 1..=4 {
        let mut model = Model::new("permutation");
        let order = model.add_sequence("order", length).unwrap();
        let last = order.member(length - 1).unwrap().clone();
        model.add_constraint(Expression::from(&last).equals(1)).unwrap();

        for solution in [solve_mip(&model).unwrap(), solve_cp(&model).unwrap()] {
            let mut values = solution.get_sequence(&order).unwrap();
            assert_eq!(values[length - 1], 1.0);
            values.sort_by(f64::total_cmp);
            let expected: Vec<f64> = (1..=length).map(|value| value as f64).collect();
            assert_eq!(values, expected);
            assert!(solution.errors().is_empty(), "{:?}", solution.errors());
        }
    }
}

#[test]
fn lowering_twice_is_idempotent() {
    let mut model = Model::new("idempotent");
    let x = model.add_integer("x", 0.0, 4.0).unwrap();
    let y = model.add_integer("y", 0.0, 4.0).unwrap();
    let expression = (Expression::from(&x) * &y)
        .geq(2)
        .or(Expression::from(&x).not_equals(&y));

    let mut cp = CpAdapter::new(&model, ReferenceSolver::new(), SolverConfig::default()).unwrap();
    let first = cp.lower(&expression).unwrap();
    let nodes = cp.backend().num_nodes();
    assert_eq!(cp.lower(&expression).unwrap(), first);
    assert_eq!(cp.backend().num_nodes(), nodes);

    let mut mip = MipAdapter::new(&model, ReferenceSolver::new(), SolverConfig::default()).unwrap();
    let first = mip.lower(&expression).unwrap();
    let nodes = mip.backend().num_nodes();
    assert_eq!(mip.lower(&expression).unwrap(), first);
    assert_eq!(mip.backend().num_nodes(), nodes);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn deduced_values_match_their_definition(
        value in 0i32..6,
        slope in -3i32..=3,
        offset in -5i32..=5,
    ) {
        init_logging();
        let mut model = Model::new("deduced");
        let x = model.add_integer("x", value as f64, value as f64).unwrap();
        let line = model
            .add_deduced_variable(
                "line",
                VariableType::Integer,
                Expression::from(&x) * slope + offset,
            )
            .unwrap();
        let expected = (slope * value + offset) as f64;
        for solution in [solve_mip(&model).unwrap(), solve_cp(&model).unwrap()] {
            prop_assert_eq!(solution.get(&line), Some(expected));
            prop_assert!(solution.errors().is_empty());
        }
    }

    #[test]
    fn reified_relations_agree_with_the_evaluator(
        value in 0i32..6,
        threshold in 0i32..6,
        relation in 0usize..RELATIONS.len(),
    ) {
        init_logging();
        let mut model = Model::new("reify");
        let x = model.add_integer("x", value as f64, value as f64).unwrap();
        let flag = model
            .add_deduced_variable(
                "flag",
                VariableType::Boolean,
                relate(relation, Expression::from(&x), threshold as f64),
            )
            .unwrap();
        let truth = holds(relation, value as f64, threshold as f64);
        for solution in [solve_mip(&model).unwrap(), solve_cp(&model).unwrap()] {
            prop_assert_eq!(
                solution.get(&flag),
                Some(if truth { 1.0 } else { 0.0 }),
                "x = {}, relation {} {}", value, RELATIONS[relation], threshold
            );
        }
    }

    #[test]
    fn conditionals_take_the_first_true_branch(a in any::<bool>(), b in any::<bool>()) {
        init_logging();
        let mut model = Model::new("first-match");
        let first = model.add_boolean("a").unwrap();
        let second = model.add_boolean("b").unwrap();
        model
            .add_constraint(Expression::from(&first).equals(if a { 1 } else { 0 }))
            .unwrap();
        model
            .add_constraint(Expression::from(&second).equals(if b { 1 } else { 0 }))
            .unwrap();
        let chosen = model
            .add_deduced_variable(
                "chosen",
                VariableType::Integer,
                n_ary_if(vec![
                    Expression::from(&first),
                    Expression::constant(10.0),
                    Expression::from(&second),
                    Expression::constant(20.0),
                    Expression::constant(30.0),
                ])
                .unwrap(),
            )
            .unwrap();
        let expected = if a { 10.0 } else if b { 20.0 } else { 30.0 };
        for solution in [solve_mip(&model).unwrap(), solve_cp(&model).unwrap()] {
            prop_assert_eq!(solution.get(&chosen), Some(expected));
        }
    }

    #[test]
    fn solutions_satisfy_the_evaluator(
        relation in 0usize..RELATIONS.len(),
        bound in 0i32..=10,
        distinct in any::<bool>(),
    ) {
        init_logging();
        let mut model = Model::new("agreement");
        let x = model.add_integer("x", 0.0, 5.0).unwrap();
        let y = model.add_integer("y", 0.0, 5.0).unwrap();
        model
            .add_constraint(relate(relation, Expression::from(&x) + &y, bound as f64))
            .unwrap();
        if distinct {
            model.add_constraint(Expression::from(&x).not_equals(&y)).unwrap();
        }
        let satisfiable = (0..=5).any(|x| {
            (0..=5).any(|y| {
                holds(relation, (x + y) as f64, bound as f64) && (!distinct || x != y)
            })
        });

        for outcome in [solve_mip(&model), solve_cp(&model)] {
            match outcome {
                Ok(solution) => {
                    prop_assert!(satisfiable);
                    let evaluator = Evaluator::new(&model, &solution);
                    for constraint in model.constraints() {
                        prop_assert_eq!(evaluator.is_true(&constraint.expression), Ok(true));
                    }
                    prop_assert!(solution.errors().is_empty());
                }
                Err(ModelError::Infeasible(_)) => prop_assert!(!satisfiable),
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }
    }
}
