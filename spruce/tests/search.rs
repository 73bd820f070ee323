use spruce::search::{
    parser::{parse, Term},
    NoExt, SearchContext, Value,
};

fn eval(expr: &str) -> spruce::Result<Value> {
    let term = parse(expr)?;
    SearchContext::new().run(&term, &mut NoExt)
}

#[test]
fn numeric_tower() {
    assert_eq!(eval("(+ 1 2 3)").unwrap(), Value::Int(6));
    assert_eq!(eval("(+ 1.0 2)").unwrap(), Value::Float(3.0));
    assert_eq!(eval("(* 2 (+ 1 2))").unwrap(), Value::Int(6));
    assert!(matches!(
        eval("(/ 10 0)"),
        Err(spruce::Error::Search(_))
    ));
}

#[test]
fn conditional_returns_branch_value() {
    assert_eq!(
        eval("(if (> 3 2) \"yes\" \"no\")").unwrap(),
        Value::Str("yes".into())
    );
}

#[test]
fn throw_message_is_retrievable() {
    let term = parse("(+ 1 \"nope\")").unwrap();
    let mut ctx = SearchContext::new();

    let err = ctx.run(&term, &mut NoExt).unwrap_err();
    assert!(matches!(err, spruce::Error::Search(_)));
    assert!(ctx.exception().is_some());

    // a successful run clears the exception slot
    let term = parse("(+ 1 2)").unwrap();
    ctx.run(&term, &mut NoExt).unwrap();
    assert!(ctx.exception().is_none());
}

#[test]
fn pretty_printer_round_trips_evaluation() {
    let exprs = [
        "(+ 1 2 3)",
        "(if (> 3 2) \"y es\" (+ 1.5 2))",
        "(begin (cast-string 42) (and true (not false)))",
        "(or (= 1 2) (< \"a\" \"b\"))",
    ];

    for expr in exprs {
        let term = parse(expr).unwrap();
        let pretty = term.to_string();
        let reparsed = parse(&pretty).unwrap();

        let a = SearchContext::new().run(&term, &mut NoExt).unwrap();
        let b = SearchContext::new().run(&reparsed, &mut NoExt).unwrap();
        assert_eq!(a, b, "{expr} vs {pretty}");
    }
}

#[test]
fn and_is_commutative_for_bools_and_arrays() {
    assert_eq!(eval("(and true false)").unwrap(), eval("(and false true)").unwrap());

    let mut ctx = SearchContext::new();
    ctx.add_variable("x", Value::Array(vec!["1".into(), "2".into()]));
    ctx.add_variable("y", Value::Array(vec!["2".into(), "3".into()]));

    let xy = ctx.run(&parse("(and x y)").unwrap(), &mut NoExt).unwrap();
    let yx = ctx.run(&parse("(and y x)").unwrap(), &mut NoExt).unwrap();

    let (Value::Array(mut xy), Value::Array(mut yx)) = (xy, yx) else {
        panic!("expected arrays");
    };
    xy.sort();
    yx.sort();
    assert_eq!(xy, yx);
    assert_eq!(xy, ["2".to_owned()]);
}

#[test]
fn or_unions_every_array_argument() {
    let mut ctx = SearchContext::new();
    ctx.add_variable("empty", Value::Array(vec![]));
    ctx.add_variable("a", Value::Array(vec!["1".into()]));
    ctx.add_variable("b", Value::Array(vec!["2".into(), "1".into()]));

    // an empty first argument must not short-circuit the union
    let value = ctx
        .run(&parse("(or empty a b)").unwrap(), &mut NoExt)
        .unwrap();
    assert_eq!(value, Value::Array(vec!["1".into(), "2".into()]));
}

#[test]
fn symbols_are_lexically_scoped() {
    let mut ctx = SearchContext::new();
    ctx.add_variable("limit", Value::Int(10));

    let term = parse("(< (+ 1 2) limit)").unwrap();
    assert_eq!(ctx.run(&term, &mut NoExt).unwrap(), Value::Bool(true));

    ctx.push_frame();
    ctx.add_variable("limit", Value::Int(2));
    assert_eq!(ctx.run(&term, &mut NoExt).unwrap(), Value::Bool(false));

    ctx.pop_frame();
    assert_eq!(ctx.run(&term, &mut NoExt).unwrap(), Value::Bool(true));
}

#[test]
fn quoted_strings_keep_escapes() {
    let term = parse(r#"(cast-string "a \"b\" \\ c")"#).unwrap();
    let Value::Str(s) = SearchContext::new().run(&term, &mut NoExt).unwrap() else {
        panic!("expected a string");
    };
    assert_eq!(s, r#"a "b" \ c"#);

    // and the pretty printer re-escapes them
    assert_eq!(
        term.to_string(),
        r#"(cast-string "a \"b\" \\ c")"#
    );
}

#[test]
fn parse_errors_are_search_errors() {
    for bad in ["", "atom", "(unclosed", "(a))", "(\"dangling)"] {
        assert!(
            matches!(parse(bad), Err(spruce::Error::Search(_))),
            "{bad:?} should fail to parse"
        );
    }

    let _ = Term::List(Vec::new());
}
