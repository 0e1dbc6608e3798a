//! Property-based invariant tests for property chain traversal.
//!
//! For a chain `Order.items.name` over a list of `n` lines:
//! 1. `each` restricted to the leaf property visits exactly `n` targets.
//! 2. `connects(order, line, name)` holds iff `line` is currently in `items`.
//! 3. `value` yields the leaf values in list order.
//! 4. A leaf change notifies exactly the orders whose list holds the line.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;
use ripple_model::{Entity, Model, PropertyDef, Value};

// ── Fixture ───────────────────────────────────────────────────────────────

fn model() -> Model {
    let model = Model::default();
    let order = model.define_type("Order", None).unwrap();
    let line = model.define_type("Line", None).unwrap();
    order
        .add_property(PropertyDef::reference("items", "Line").list())
        .unwrap();
    line.add_property(PropertyDef::scalar("name")).unwrap();
    model
}

fn line(model: &Model, name: i64) -> Entity {
    let line = model.create("Line").unwrap();
    line.set("name", name).unwrap();
    line
}

proptest! {
    #[test]
    fn fan_out_matches_list_contents(
        n in 0usize..12,
        membership in proptest::collection::vec(any::<bool>(), 12),
    ) {
        let model = model();
        let order_type = model.entity_type("Order").unwrap();
        let chain = model.chain(&order_type, "items.name").unwrap();
        let name = chain.last_property().clone();

        let lines: Vec<Entity> = (0..12).map(|i| line(&model, i as i64)).collect();
        let members: Vec<Entity> = lines
            .iter()
            .take(n)
            .zip(&membership)
            .filter(|(_, keep)| **keep)
            .map(|(l, _)| l.clone())
            .collect();

        let order = model.create("Order").unwrap();
        order
            .set("items", members.iter().cloned().map(Value::from).collect::<Vec<_>>())
            .unwrap();

        let mut visits = 0;
        chain.each(&order, Some(&name), |_, _| {
            visits += 1;
            true
        });
        prop_assert_eq!(visits, members.len());

        for l in &lines {
            prop_assert_eq!(chain.connects(&order, l, &name), members.contains(l));
        }

        let expected: Vec<Value> = members.iter().map(|l| l.peek("name")).collect();
        prop_assert_eq!(chain.value(&order).unwrap(), Value::List(expected));
    }

    #[test]
    fn leaf_change_notifies_exactly_the_holding_orders(
        holders in proptest::collection::vec(any::<bool>(), 1..6),
    ) {
        let model = model();
        let order_type = model.entity_type("Order").unwrap();
        let chain = model.chain(&order_type, "items.name").unwrap();
        let shared = line(&model, 0);

        let orders: Vec<Entity> = holders
            .iter()
            .map(|holds| {
                let order = model.create("Order").unwrap();
                if *holds {
                    order.set("items", vec![Value::from(shared.clone())]).unwrap();
                }
                order
            })
            .collect();

        let notified = Rc::new(RefCell::new(Vec::new()));
        let n = Rc::clone(&notified);
        let _sub = chain.add_changed(
            move |change| {
                n.borrow_mut().push(change.root.clone());
                Ok(())
            },
            None,
            false,
            false,
        );

        shared.set("name", 99).unwrap();
        let expected: Vec<Entity> = orders
            .iter()
            .zip(&holders)
            .filter(|(_, holds)| **holds)
            .map(|(o, _)| o.clone())
            .collect();
        prop_assert_eq!(&*notified.borrow(), &expected);
    }
}
