mod fixtures;

use fixtures::fixture;
use regraft_core::error::ErrorClass;

#[test]
fn case_insensitive_tag_duplicates_collapse_onto_the_lowest_id() {
    let fx = fixture();
    fx.exec(
        "INSERT INTO tag (id, name) VALUES (1, 'A'), (2, 'a'), (3, 'B');
         INSERT INTO partner (id, name) VALUES (7, 'p'), (8, 'q');
         INSERT INTO partner_tag (partner_id, tag_id) VALUES
             (7, 1),
             (7, 2),
             (8, 2);
         INSERT INTO task (id, name, tag_id) VALUES (1, 't1', 2), (2, 't2', 3);
         INSERT INTO external_name (name, entity, res_id) VALUES
             ('base.tag_a_upper', 'tag', 1),
             ('base.tag_a_lower', 'tag', 2);",
    );

    fx.session
        .collapse("tag", "lower(name)", "id")
        .expect("collapse should succeed");

    assert_eq!(
        fx.ids("SELECT id FROM tag ORDER BY id"),
        vec![1, 3],
        "row 2 merges into survivor 1, row 3 is untouched"
    );
    assert_eq!(
        fx.ids("SELECT partner_id FROM partner_tag WHERE tag_id = 1 ORDER BY partner_id"),
        vec![7, 8],
        "links of the duplicate land on the survivor without duplicate pairs"
    );
    assert_eq!(
        fx.count("SELECT count(*) FROM partner_tag"),
        2,
        "no duplicate (partner, tag) pair may remain"
    );
    assert_eq!(
        fx.ids("SELECT tag_id FROM task ORDER BY id"),
        vec![1, 3],
        "many-to-one referrers are updated in place"
    );
    assert_eq!(
        fx.ids("SELECT res_id FROM external_name WHERE entity = 'tag' ORDER BY name"),
        vec![1, 1],
        "registry pointers of the duplicates follow the survivor"
    );
}

#[test]
fn collapsing_twice_is_idempotent() {
    let fx = fixture();
    fx.exec(
        "INSERT INTO tag (id, name) VALUES (1, 'x'), (2, 'X');
         INSERT INTO partner (id, name) VALUES (7, 'p');
         INSERT INTO partner_tag (partner_id, tag_id) VALUES (7, 1), (7, 2);",
    );

    fx.session
        .collapse("tag", "lower(name)", "id")
        .expect("first collapse");
    let snapshot = fx.snapshot("partner_tag");

    fx.session
        .collapse("tag", "lower(name)", "id")
        .expect("second collapse is a no-op");
    assert_eq!(
        fx.snapshot("partner_tag"),
        snapshot,
        "a collapsed table must be a fixed point"
    );
    assert_eq!(fx.ids("SELECT id FROM tag"), vec![1]);
}

#[test]
fn entity_without_referrers_is_refused() {
    let fx = fixture();
    fx.exec("INSERT INTO orphan (id, name) VALUES (1, 'x'), (2, 'x')");

    let err = fx
        .session
        .collapse("orphan", "name", "id")
        .expect_err("collapsing an unreferenced entity is API misuse");
    assert_eq!(err.class, ErrorClass::InvariantViolation, "{err:?}");
    assert_eq!(
        fx.count("SELECT count(*) FROM orphan"),
        2,
        "a refused collapse must not touch rows"
    );
}

#[test]
fn no_duplicates_means_no_work() {
    let fx = fixture();
    fx.exec("INSERT INTO tag (id, name) VALUES (1, 'a'), (2, 'b')");

    fx.session
        .collapse("tag", "lower(name)", "id")
        .expect("unique keys collapse to nothing");
    assert_eq!(fx.ids("SELECT id FROM tag ORDER BY id"), vec![1, 2]);
}

#[test]
fn order_key_picks_the_survivor_within_a_group() {
    let fx = fixture();
    // name order prefers the CamelCase spelling even on a higher id
    fx.exec(
        "INSERT INTO tag (id, name) VALUES (1, 'alpha'), (2, 'Alpha');
         INSERT INTO partner (id, name) VALUES (7, 'p');
         INSERT INTO partner_tag (partner_id, tag_id) VALUES (7, 1);",
    );

    fx.session
        .collapse("tag", "lower(name)", "name")
        .expect("collapse ordered by name");

    assert_eq!(
        fx.ids("SELECT id FROM tag"),
        vec![2],
        "'Alpha' sorts before 'alpha' and survives"
    );
    assert_eq!(fx.ids("SELECT tag_id FROM partner_tag"), vec![2]);
}
