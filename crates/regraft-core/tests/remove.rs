mod fixtures;

use fixtures::fixture;
use regraft_core::catalog::Catalog;
use regraft_core::error::ErrorClass;

#[test]
fn removal_cascades_through_delegation_and_scrubs_references() {
    let fx = fixture();
    let partner_ord = fx.catalog.entity_ordinal("partner").expect("ordinal");
    fx.exec(&format!(
        "INSERT INTO partner (id, name) VALUES (1, 'gone'), (2, 'stays');
         INSERT INTO app_user (id, login, partner_id) VALUES (11, 'u1', 1), (12, 'u2', 2);
         INSERT INTO tag (id, name) VALUES (5, 't');
         INSERT INTO partner_tag (partner_id, tag_id) VALUES (1, 5), (2, 5);
         INSERT INTO attachment (id, res_model, res_id, name) VALUES
             (1, 'partner', 1, 'scrubbed'),
             (2, 'partner', 2, 'stays'),
             (3, 'order', 1, 'other entity');
         INSERT INTO audit_log (id, res_model_ord, res_id, note) VALUES
             (1, {partner_ord}, 1, 'scrubbed');
         INSERT INTO message (id, target_ref) VALUES (1, 'partner,1'), (2, 'partner,2');
         INSERT INTO partner_note (id, res_id, body) VALUES (1, 1, 'scrubbed'), (2, 2, 'stays');
         INSERT INTO default_store (entity, field, value) VALUES
             ('order', 'partner_id', '1'),
             ('order', 'partner_id', '2');
         INSERT INTO external_name (name, entity, res_id) VALUES
             ('base.p1', 'partner', 1),
             ('base.p2', 'partner', 2),
             ('base.t5', 'tag', 5);"
    ));

    let deleted = fx.session.remove("partner", &[1]).expect("removal");
    assert_eq!(deleted, 2, "one partner row and one delegated user row");

    assert_eq!(fx.ids("SELECT id FROM partner"), vec![2]);
    assert_eq!(fx.ids("SELECT id FROM app_user"), vec![12]);
    assert_eq!(
        fx.ids("SELECT partner_id FROM partner_tag"),
        vec![2],
        "join rows cascade with the record"
    );
    assert_eq!(
        fx.ids("SELECT id FROM attachment ORDER BY id"),
        vec![2, 3],
        "only the removed entity's site rows are scrubbed"
    );
    assert_eq!(fx.count("SELECT count(*) FROM audit_log"), 0);
    assert_eq!(fx.ids("SELECT id FROM message"), vec![2]);
    assert_eq!(fx.ids("SELECT id FROM partner_note"), vec![2]);
    assert_eq!(
        fx.count("SELECT count(*) FROM default_store WHERE value = '1'"),
        0,
        "defaults naming the removed id are cleaned"
    );
    assert_eq!(
        fx.count("SELECT count(*) FROM default_store WHERE value = '2'"),
        1
    );
    assert_eq!(
        fx.ids("SELECT res_id FROM external_name WHERE entity = 'partner' ORDER BY res_id"),
        vec![2],
        "registry names of removed records are dropped"
    );
}

#[test]
fn restrict_references_block_removal() {
    let fx = fixture();
    fx.exec(
        "INSERT INTO partner (id, name) VALUES (1, 'referenced');
         INSERT INTO sale_order (id, partner_id) VALUES (1, 1);",
    );

    let err = fx
        .session
        .remove("partner", &[1])
        .expect_err("a restrict edge must block the delete");
    assert_eq!(err.class, ErrorClass::Backend, "{err:?}");
    assert_eq!(
        fx.count("SELECT count(*) FROM partner"),
        1,
        "the blocked row must survive"
    );
}

#[test]
fn menu_removal_swallows_the_subtree() {
    let fx = fixture();
    fx.exec(
        "INSERT INTO menu (id, parent_id, name) VALUES
             (1, NULL, 'root'),
             (2, 1, 'kept child'),
             (3, 1, 'removed child'),
             (4, 3, 'grandchild');",
    );

    let deleted = fx.session.remove("menu", &[3]).expect("menu removal");
    assert_eq!(deleted, 2, "the node and its descendant");
    assert_eq!(fx.ids("SELECT id FROM menu ORDER BY id"), vec![1, 2]);
}

#[test]
fn document_removal_deactivates_descendants_first() {
    let fx = fixture();
    fx.exec(
        "INSERT INTO doc_view (id, parent_id, active, name) VALUES
             (10, NULL, 1, 'removed root'),
             (11, 10, 1, 'customized child'),
             (12, 11, 1, 'grandchild'),
             (20, NULL, 1, 'unrelated');",
    );

    let deleted = fx.session.remove("view", &[10]).expect("view removal");
    assert_eq!(deleted, 1, "only the requested document is deleted");
    assert_eq!(
        fx.ids("SELECT id FROM doc_view WHERE active = 0 ORDER BY id"),
        vec![11, 12],
        "descendants are deactivated, not deleted"
    );
    assert_eq!(
        fx.ids("SELECT id FROM doc_view WHERE active = 1 ORDER BY id"),
        vec![20]
    );
}

#[test]
fn removing_nothing_is_a_no_op() {
    let fx = fixture();
    fx.exec("INSERT INTO partner (id, name) VALUES (1, 'p')");
    let deleted = fx.session.remove("partner", &[]).expect("empty removal");
    assert_eq!(deleted, 0);
    assert_eq!(fx.count("SELECT count(*) FROM partner"), 1);
}

#[test]
fn unknown_entity_is_a_schema_error() {
    let fx = fixture();
    let err = fx
        .session
        .remove("not_an_entity", &[1])
        .expect_err("unknown entities must fail loudly");
    assert_eq!(err.class, ErrorClass::Schema, "{err:?}");
}
