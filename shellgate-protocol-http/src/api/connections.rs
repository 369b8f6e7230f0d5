use poem::web::Data;
use poem::{handler, Response};
use sea_orm::{ColumnTrait, Condition, EntityTrait, QueryFilter, QueryOrder};
use shellgate_common::ShellgateError;
use shellgate_core::permissions::PERM_CONNECTION_VIEW;
use shellgate_core::{ConnectionSnapshot, Services};
use shellgate_db_entities::Connection;

use crate::auth::CurrentUser;
use crate::envelope::api_ok;

/// Connections visible to the caller: their own, their teams', or all of
/// them with a global view grant.
#[handler]
pub async fn list(Data(services): Data<&Services>, user: CurrentUser) -> poem::Result<Response> {
    let sees_all = services
        .permissions
        .user_has_permission(&user.user_id, PERM_CONNECTION_VIEW)
        .await?;

    let query = Connection::Entity::find().order_by_asc(Connection::Column::Name);
    let query = if sees_all {
        query
    } else {
        let team_ids = services.permissions.team_ids_for_user(&user.user_id).await?;
        query.filter(
            Condition::any()
                .add(Connection::Column::OwnerUserId.eq(user.user_id))
                .add(Connection::Column::TeamId.is_in(team_ids)),
        )
    };
    let connections = {
        let db = services.db.lock().await;
        query.all(&*db).await.map_err(ShellgateError::from)?
    };

    let snapshots: Vec<ConnectionSnapshot> = connections.into_iter().map(Into::into).collect();
    Ok(api_ok(snapshots))
}
