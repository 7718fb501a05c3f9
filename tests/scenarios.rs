// End-to-end scenarios through both lowerings on the reference solver

use letsmodel::domain::{at, collection, count, Evaluator};
use letsmodel::{
    CpAdapter, Expression, MipAdapter, Model, ModelError, ReferenceSolver, Solution,
    SolutionStatus, SolverBackend, SolverConfig, SolverFactory, SolverService, VariableType,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn solve_mip(model: &Model) -> letsmodel::domain::Result<Solution<'_>> {
    MipAdapter::new(model, ReferenceSolver::new(), SolverConfig::default())?.solve()
}

fn solve_cp(model: &Model) -> letsmodel::domain::Result<Solution<'_>> {
    CpAdapter::new(model, ReferenceSolver::new(), SolverConfig::default())?.solve()
}

/// Every top-level constraint holds under the exact evaluator
fn assert_consistent(model: &Model, solution: &Solution<'_>) {
    let evaluator = Evaluator::new(model, solution);
    for constraint in model.constraints() {
        assert_eq!(
            evaluator.is_true(&constraint.expression),
            Ok(true),
            "constraint '{}'",
            constraint.label()
        );
    }
    assert!(solution.errors().is_empty(), "{:?}", solution.errors());
}

fn collections_model(collections: Vec<Vec<f64>>) -> Model {
    let mut model = Model::new("collections");
    let count = collections.len();
    model.set_collection_lookup(
        move |key| {
            collections
                .get(key)
                .cloned()
                .ok_or_else(|| format!("key {} is unknown", key))
        },
        count,
    );
    model
}

#[test]
fn linear_cover_reaches_the_cheapest_point() {
    init_logging();
    let mut model = Model::new("cover");
    let x = model.add_integer("x", 0.0, f64::INFINITY).unwrap();
    let y = model.add_integer("y", 0.0, f64::INFINITY).unwrap();
    model.minimize(&x * 2.0 + &y * 3.0).unwrap();
    model
        .add_constraint((Expression::from(&x) + &y).geq(10))
        .unwrap();

    let solution = solve_mip(&model).unwrap();
    assert_eq!(solution.status(), SolutionStatus::Optimal);
    assert_eq!(solution.get(&x), Some(10.0));
    assert_eq!(solution.get(&y), Some(0.0));
    assert_eq!(solution.objective_value(), Some(20.0));
    assert_consistent(&model, &solution);
}

#[test]
fn product_cover_is_small() {
    init_logging();
    let mut model = Model::new("product");
    let x = model.add_integer("x", 1.0, f64::INFINITY).unwrap();
    let y = model.add_integer("y", 1.0, f64::INFINITY).unwrap();
    model.minimize(Expression::from(&x) + &y).unwrap();
    model
        .add_constraint((Expression::from(&x) * &y).geq(12))
        .unwrap();

    for solution in [solve_mip(&model).unwrap(), solve_cp(&model).unwrap()] {
        let (x, y) = (solution.get(&x).unwrap(), solution.get(&y).unwrap());
        assert!(x + y <= 8.0);
        assert!(x * y >= 12.0);
        assert_consistent(&model, &solution);
    }
}

#[test]
fn collection_lookup_by_variable_key() {
    init_logging();
    let mut model = collections_model(vec![vec![10.0, 20.0, 30.0], vec![40.0, 50.0, 60.0]]);
    let key = model.add_integer("key", 0.0, 1.0).unwrap();
    let index = model.add_integer("index", 1.0, 3.0).unwrap();
    let value = model
        .add_deduced_variable(
            "value",
            VariableType::Integer,
            at(&index, [collection(&key)]).unwrap(),
        )
        .unwrap();
    model.add_constraint(Expression::from(&key).equals(1)).unwrap();
    model.add_constraint(Expression::from(&index).equals(3)).unwrap();

    let mut assignment = Solution::new(&model);
    assignment.set(&key, 1.0).unwrap();
    assignment.set(&index, 3.0).unwrap();
    assert_eq!(assignment.get(&value), Some(60.0));

    for solution in [solve_mip(&model).unwrap(), solve_cp(&model).unwrap()] {
        assert_eq!(solution.get(&value), Some(60.0));
        assert_consistent(&model, &solution);
    }
}

#[test]
fn disequality_on_a_fixed_variable_is_infeasible() {
    init_logging();
    let mut model = Model::new("disequality");
    let x = model.add_integer("x", 5.0, 5.0).unwrap();
    model
        .add_constraint(Expression::from(&x).not_equals(5))
        .unwrap();
    assert!(matches!(solve_mip(&model), Err(ModelError::Infeasible(_))));
    assert!(matches!(solve_cp(&model), Err(ModelError::Infeasible(_))));
}

#[test]
fn strict_inequality_needs_a_gap() {
    init_logging();
    let mut tied = Model::new("tied");
    let x = tied.add_integer("x", 5.0, 5.0).unwrap();
    let y = tied.add_integer("y", 5.0, 5.0).unwrap();
    tied.add_constraint(Expression::from(&x).lt(&y)).unwrap();
    assert!(matches!(solve_mip(&tied), Err(ModelError::Infeasible(_))));
    assert!(matches!(solve_cp(&tied), Err(ModelError::Infeasible(_))));

    let mut apart = Model::new("apart");
    let x = apart.add_integer("x", 5.0, 5.0).unwrap();
    let y = apart.add_integer("y", 6.0, 6.0).unwrap();
    apart.add_constraint(Expression::from(&x).lt(&y)).unwrap();
    for solution in [solve_mip(&apart).unwrap(), solve_cp(&apart).unwrap()] {
        assert_eq!(solution.get(&x), Some(5.0));
        assert_eq!(solution.get(&y), Some(6.0));
    }
}

#[test]
fn canonical_forms() {
    let mut model = Model::new("strings");
    let x = model.add_integer("x", 0.0, 10.0).unwrap();
    let y = model.add_boolean("y").unwrap();
    let z = model.add_real("z", 0.0, 1.0).unwrap();
    assert_eq!(
        (&x * 3.0 + &z * 5.0).stringify(),
        "( x * 3.00 ) + ( z * 5.00 )"
    );
    assert_eq!((!&y).and(&y).stringify(), "( !y ) && y");
    assert_eq!(
        Expression::from(&y)
            .implies(Expression::from(&x).geq(4))
            .stringify(),
        "( !y ) || ( x >= 4.00 )"
    );
}

#[test]
fn count_over_a_variable_key() {
    init_logging();
    let mut model = collections_model(vec![vec![10.0, 20.0, 30.0], vec![40.0, 50.0]]);
    let key = model.add_integer("key", 0.0, 1.0).unwrap();
    let result = model.add_integer("result", 0.0, 10.0).unwrap();
    model
        .add_constraint(
            Expression::from(&result)
                .equals(count([collection(&key)]))
                .and(Expression::from(&key).equals(0)),
        )
        .unwrap();

    for solution in [solve_mip(&model).unwrap(), solve_cp(&model).unwrap()] {
        assert_eq!(solution.get(&result), Some(3.0));
        assert_consistent(&model, &solution);
    }
}

#[test]
fn factory_backends_agree() {
    init_logging();
    let mut model = Model::new("agree");
    let x = model.add_integer("x", 0.0, 6.0).unwrap();
    let y = model.add_integer("y", 0.0, 6.0).unwrap();
    model
        .add_constraint((Expression::from(&x) - &y).not_equals(0))
        .unwrap();
    model
        .add_constraint((Expression::from(&x) + &y).equals(6))
        .unwrap();
    model.maximize(Expression::from(&x) * &y).unwrap();

    let mut objectives = Vec::new();
    for backend in [SolverBackend::Mip, SolverBackend::Cp] {
        let config = SolverConfig::default().with_backend(backend);
        let solution = SolverFactory::solve(&model, config).unwrap();
        assert_consistent(&model, &solution);
        objectives.push(solution.objective_value());
    }
    // 3·3 is excluded by x != y
    assert_eq!(objectives, vec![Some(8.0), Some(8.0)]);
}

#[test]
fn node_limits_stop_with_an_incumbent() {
    init_logging();
    let mut model = Model::new("limited");
    let family = model
        .add_indexed_family("b", VariableType::Boolean)
        .unwrap();
    let mut total = Expression::constant(0.0);
    for _ in 0..10 {
        let member = model.emplace(&family, 0.0, 1.0).unwrap();
        total = total + &member;
    }
    model.maximize(total).unwrap();
    let config = SolverConfig::default()
        .with_backend(SolverBackend::Mip)
        .with_node_limit(11);
    let solution = SolverFactory::solve(&model, config).unwrap();
    assert_eq!(solution.status(), SolutionStatus::Feasible);
    assert!(solution.complete());
}

#[cfg(feature = "highs")]
#[test]
fn linear_cover_on_highs() {
    init_logging();
    let mut model = Model::new("cover");
    let x = model.add_integer("x", 0.0, f64::INFINITY).unwrap();
    let y = model.add_integer("y", 0.0, f64::INFINITY).unwrap();
    model.minimize(&x * 2.0 + &y * 3.0).unwrap();
    model
        .add_constraint((Expression::from(&x) + &y).geq(10))
        .unwrap();

    let config = SolverConfig::default().with_backend(SolverBackend::Highs);
    let solution = SolverFactory::solve(&model, config).unwrap();
    assert_eq!(solution.get(&x), Some(10.0));
    assert_eq!(solution.objective_value(), Some(20.0));
}

#[test]
fn a_rejected_sequence_does_not_block_a_complete_solution() {
    init_logging();
    let mut model = Model::new("rejected");
    model.add_integer("s[1]", 0.0, 5.0).unwrap();
    assert!(model.add_sequence("s", 3).is_err());
    let first = model.add_integer("s[0]", 0.0, 5.0).unwrap();
    model.add_constraint(Expression::from(&first).geq(2)).unwrap();

    for solution in [solve_mip(&model).unwrap(), solve_cp(&model).unwrap()] {
        assert!(solution.complete());
        assert!(solution.errors().is_empty(), "{:?}", solution.errors());
    }
}
