//! Dispatch of inbound messages: requests are recorded in a route table and flooded to all other
//!  connections, replies are sent back along the path recorded for their request.

use std::sync::{Arc, PoisonError, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::config::ServentConfig;
use crate::messaging::connection::{ConnectionHandle, HandleKey};
use crate::messaging::frame_reader::FrameLimits;
use crate::messaging::guid::Guid;
use crate::messaging::message::Message;
use crate::messaging::payload::pong::Pong;
use crate::messaging::payload::push_request::PushRequest;
use crate::messaging::payload::query::Query;
use crate::messaging::payload::query_reply::QueryReply;
use crate::messaging::payload::Payload;
use crate::reply_cache::ReplyCache;
use crate::routing::route_table::{ReplyRoute, RouteTable};
use crate::util::safe_converter::SafeCast;

/// Sends push requests towards a servent, as seen by the push coordinator
#[cfg_attr(test, mockall::automock)]
pub trait PushSender: Send + Sync {
    /// Sends a push request with a fresh identifier. Returns `true` if it was sent to at least
    ///  one connection.
    fn send_push(&self, push: PushRequest) -> bool;
}

pub struct MessageRouter {
    config: Arc<ServentConfig>,
    client_guid: Guid,
    ping_routes: RouteTable,
    query_routes: RouteTable,
    /// maps servent ids (from query replies) to the connection the reply came through
    push_routes: RouteTable,
    reply_cache: Arc<ReplyCache>,
    connections: RwLock<FxHashMap<HandleKey, Arc<dyn ConnectionHandle>>>,
    local: Arc<dyn ConnectionHandle>,
}

impl MessageRouter {
    pub fn new(config: Arc<ServentConfig>, client_guid: Guid, reply_cache: Arc<ReplyCache>, local: Arc<dyn ConnectionHandle>) -> MessageRouter {
        MessageRouter {
            ping_routes: RouteTable::new("pings", config.ping_route_window, config.max_route_table_size),
            query_routes: RouteTable::new("queries", config.query_route_window, config.max_route_table_size),
            push_routes: RouteTable::new("pushes", config.push_route_window, config.max_route_table_size),
            config,
            client_guid,
            reply_cache,
            connections: Default::default(),
            local,
        }
    }

    pub fn client_guid(&self) -> Guid {
        self.client_guid
    }

    pub fn frame_limits(&self) -> FrameLimits {
        self.config.frame_limits()
    }

    pub fn connection_opened(&self, connection: Arc<dyn ConnectionHandle>) {
        debug!("registering connection {:?}", connection);
        self.connections.write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.key(), connection);
    }

    /// Forgets a closed connection in all route tables. Replies for requests that arrived through
    ///  the connection are dropped from now on.
    pub fn connection_closed(&self, key: HandleKey) {
        debug!("unregistering connection {:?}", key);
        self.connections.write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);

        self.ping_routes.forget(key);
        self.query_routes.forget(key);
        self.push_routes.forget(key);
    }

    pub fn num_connections(&self) -> usize {
        self.connections.read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Handles a message received from a peer. This accounts for the hop the message travelled.
    pub fn on_message(&self, mut msg: Message, from: Arc<dyn ConnectionHandle>) {
        msg.relay();

        match msg.payload.clone() {
            Payload::Ping => self.on_ping(msg, from),
            Payload::Pong(pong) => self.on_pong(msg, pong, from),
            Payload::Query(_) => self.on_query(msg, from),
            Payload::QueryReply(reply) => self.on_query_reply(msg, reply, from),
            Payload::Push(push) => self.on_push(msg, push),
        }
    }

    /// Handles a message received as a UDP datagram. Only push requests are accepted this way:
    ///  they are delivered locally or, acting as a push proxy, forwarded along the push route.
    pub fn on_datagram(&self, mut msg: Message) {
        msg.relay();

        match msg.payload.clone() {
            Payload::Push(push) => self.on_push(msg, push),
            _ => trace!("ignoring {:?} datagram {:?}", msg.function_code(), msg.guid),
        }
    }

    /// Floods a ping originating from this servent. Pongs are delivered to the local handle.
    pub fn send_ping(&self, ttl: u8) -> Guid {
        let guid = Guid::generate();
        self.ping_routes.try_route(guid, &self.local);
        let sent = self.broadcast(Arc::new(Message::ping(guid, ttl)), None);
        debug!("sent ping {:?} to {} connections", guid, sent);
        guid
    }

    /// Floods a query originating from this servent. Query replies are delivered to the local
    ///  handle.
    pub fn send_query(&self, ttl: u8, min_speed: u16, search_text: &str) -> Guid {
        let guid = Guid::generate();
        self.query_routes.try_route(guid, &self.local);
        let msg = Message::new(guid, ttl, Payload::Query(Query::new(min_speed, search_text)));
        let sent = self.broadcast(Arc::new(msg), None);
        debug!("sent query {:?} for {:?} to {} connections", guid, search_text, sent);
        guid
    }

    fn on_ping(&self, msg: Message, from: Arc<dyn ConnectionHandle>) {
        if self.ping_routes.try_route(msg.guid, &from).is_none() {
            trace!("dropping duplicate ping {:?}", msg.guid);
            return;
        }

        self.answer_ping(&msg, &from);

        if msg.ttl > 0 {
            self.broadcast(Arc::new(msg), Some(from.key()));
        }
    }

    /// Answers a ping with our own pong (if we are reachable) and with one cached pong per hop
    ///  distance the ping would still have travelled.
    fn answer_ping(&self, ping: &Message, from: &Arc<dyn ConnectionHandle>) {
        let reply_ttl = ping.hops.max(1);

        if let Some(addr) = self.config.advertised_addr {
            let pong = Pong::new(addr, self.config.shared_files, self.config.shared_kb);
            send_to(from, Arc::new(Message::new(ping.guid, reply_ttl, Payload::Pong(pong))));
        }

        let max_hops = self.reply_cache.num_hops().min(ping.ttl);
        for hops in 1..=max_hops {
            let Some(entry) = self.reply_cache.sample(hops) else {
                continue;
            };
            if entry.handle.key() == from.key() {
                continue;
            }

            let mut reply = Message::new(ping.guid, reply_ttl, Payload::Pong(entry.pong));
            reply.hops = entry.hops.min(self.config.hard_max_ttl.saturating_sub(reply_ttl));
            send_to(from, Arc::new(reply));
        }
    }

    fn on_pong(&self, msg: Message, pong: Pong, from: Arc<dyn ConnectionHandle>) {
        self.reply_cache.add(pong, msg.hops, from);

        match self.ping_routes.lookup(&msg.guid) {
            Some(handle) => self.forward_reply(msg, &handle),
            None => trace!("no route for pong {:?}", msg.guid),
        }
    }

    fn on_query(&self, msg: Message, from: Arc<dyn ConnectionHandle>) {
        if self.query_routes.try_route(msg.guid, &from).is_none() {
            trace!("dropping duplicate query {:?}", msg.guid);
            return;
        }

        if msg.ttl > 0 {
            self.broadcast(Arc::new(msg), Some(from.key()));
        }
    }

    fn on_query_reply(&self, msg: Message, reply: QueryReply, from: Arc<dyn ConnectionHandle>) {
        let Some(route) = self.query_routes.lookup_and_account(&msg.guid, msg.total_len().safe_cast(), reply.hit_count() as u32) else {
            trace!("no route for query reply {:?}", msg.guid);
            return;
        };

        // push requests for the replying servent go back the way its reply came. Only replies
        //  to queries we routed count, so unsolicited replies can not redirect push routes.
        self.push_routes.route_reply(reply.servent_id(), &from);

        if self.should_drop_reply(&route, msg.ttl) {
            debug!("dropping query reply {:?}: {} bytes / {} replies already routed", msg.guid, route.bytes_routed, route.replies_routed);
            return;
        }
        send_to(&route.handle, Arc::new(msg));
    }

    /// Limits the reply volume per query: the fewer hops a reply still has to travel, the more
    ///  bytes are forwarded for its query.
    fn should_drop_reply(&self, route: &ReplyRoute, ttl: u8) -> bool {
        if route.handle.is_local() {
            return false;
        }
        if ttl == 0 {
            return true;
        }
        if route.replies_routed > self.config.max_replies_per_query {
            return true;
        }

        let budget = match ttl {
            1 => self.config.max_reply_bytes_per_query,
            2 => self.config.max_reply_bytes_per_query / 2,
            _ => self.config.max_reply_bytes_per_query / 4,
        };
        route.bytes_routed >= budget
    }

    fn on_push(&self, msg: Message, push: PushRequest) {
        let servent_id = push.servent_id();
        if servent_id == self.client_guid {
            debug!("received push request for index {}", push.resource_index());
            self.deliver_locally(msg);
            return;
        }

        match self.push_routes.lookup(&servent_id) {
            Some(handle) => self.forward_reply(msg, &handle),
            None => trace!("no route for push request to {:?}", servent_id),
        }
    }

    fn forward_reply(&self, msg: Message, handle: &Arc<dyn ConnectionHandle>) {
        if msg.ttl == 0 && !handle.is_local() {
            trace!("dropping {:?} {:?}: TTL exhausted", msg.function_code(), msg.guid);
            return;
        }
        send_to(handle, Arc::new(msg));
    }

    fn deliver_locally(&self, msg: Message) {
        send_to(&self.local, Arc::new(msg));
    }

    /// Sends a message to all open connections except `except`, returning the number of
    ///  connections it was sent to
    fn broadcast(&self, msg: Arc<Message>, except: Option<HandleKey>) -> usize {
        let targets = self.connections.read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| Some(c.key()) != except && c.is_open())
            .cloned()
            .collect::<Vec<_>>();

        targets.iter()
            .filter(|c| send_to(c, msg.clone()))
            .count()
    }
}

fn send_to(handle: &Arc<dyn ConnectionHandle>, msg: Arc<Message>) -> bool {
    match handle.send(msg) {
        Ok(()) => true,
        Err(e) => {
            warn!("dropping message for {:?}: {}", handle, e);
            false
        }
    }
}

impl PushSender for MessageRouter {
    fn send_push(&self, push: PushRequest) -> bool {
        let servent_id = push.servent_id();
        let msg = Arc::new(Message::new(Guid::generate(), self.config.push_ttl, Payload::Push(push)));

        match self.push_routes.lookup(&servent_id) {
            Some(handle) if !handle.is_local() => send_to(&handle, msg),
            _ => {
                debug!("no route for push request to {:?} - broadcasting", servent_id);
                self.broadcast(msg, None) > 0
            }
        }
    }
}


#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use super::*;
    use crate::messaging::function_code::FunctionCode;
    use crate::messaging::handshake::ProtocolVersion;
    use crate::test_util::{as_handle, TrackingConnection};

    fn config() -> ServentConfig {
        ServentConfig::new(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6346)))
    }

    fn router_with(config: ServentConfig) -> (MessageRouter, Arc<TrackingConnection>) {
        let config = Arc::new(config);
        let local = TrackingConnection::new_local();
        let reply_cache = Arc::new(ReplyCache::new(&config));
        let router = MessageRouter::new(config, Guid::generate(), reply_cache, as_handle(&local));
        (router, local)
    }

    fn router() -> (MessageRouter, Arc<TrackingConnection>) {
        router_with(config())
    }

    fn connect(router: &MessageRouter) -> Arc<TrackingConnection> {
        let connection = TrackingConnection::new();
        router.connection_opened(as_handle(&connection));
        connection
    }

    fn pong(n: u8) -> Pong {
        Pong::new(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, n), 6346), 0, 0)
    }

    fn query_reply(guid: Guid, ttl: u8, servent_id: Guid, results_len: usize) -> Message {
        let reply = QueryReply::new(1, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 6346), 100, &vec![0u8; results_len], servent_id);
        Message::new(guid, ttl, Payload::QueryReply(reply))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_ttl_5_is_flooded_once() {
        let (router, local) = router();
        let a = connect(&router);
        let b = connect(&router);
        let c = connect(&router);

        let guid = Guid::generate();
        router.on_message(Message::ping(guid, 5), as_handle(&a));
        router.on_message(Message::ping(guid, 5), as_handle(&c));

        for target in [&b, &c] {
            let msg = target.assert_message_sent(FunctionCode::Ping, guid);
            assert_eq!((msg.ttl, msg.hops), (4, 1));
            target.assert_no_remaining_messages();
        }
        a.assert_no_remaining_messages();
        local.assert_no_remaining_messages();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_with_last_hop_is_not_flooded() {
        let (router, _) = router();
        let a = connect(&router);
        let b = connect(&router);

        router.on_message(Message::ping(Guid::generate(), 1), as_handle(&a));
        b.assert_no_remaining_messages();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_answered_with_own_pong() {
        let advertised = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6346);
        let mut config = config();
        config.advertised_addr = Some(advertised);
        config.shared_files = 12;
        let (router, _) = router_with(config);
        let a = connect(&router);

        let guid = Guid::generate();
        router.on_message(Message::ping(guid, 1), as_handle(&a));

        let reply = a.assert_message_sent(FunctionCode::Pong, guid);
        assert_eq!((reply.ttl, reply.hops), (1, 0));
        match &reply.payload {
            Payload::Pong(pong) => {
                assert_eq!(pong.addr(), advertised);
                assert_eq!(pong.shared_files(), 12);
            }
            p => panic!("unexpected payload {:?}", p),
        }
        a.assert_no_remaining_messages();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_answered_from_cache() {
        let (router, _) = router();
        let a = connect(&router);
        let b = connect(&router);

        // pongs seen by b, for a ping of our own
        let own = router.send_ping(7);
        b.assert_message_sent(FunctionCode::Ping, own);
        a.assert_message_sent(FunctionCode::Ping, own);
        for (n, hops) in [(1, 0), (2, 1), (3, 4)] {
            let mut msg = Message::new(own, 7, Payload::Pong(pong(n)));
            msg.hops = hops;
            router.on_message(msg, as_handle(&b));
        }
        assert_eq!(router.reply_cache.len(), 3);

        // a ping from a with two remaining hops after relaying
        let guid = Guid::generate();
        router.on_message(Message::ping(guid, 3), as_handle(&a));

        let mut answers = Vec::new();
        for msg in a.sent() {
            if msg.function_code() == FunctionCode::Pong {
                assert_eq!(msg.guid, guid);
                assert_eq!(msg.ttl, 1);
                answers.push(msg.hops);
            }
        }
        assert_eq!(answers, vec![1, 2]);

        // pongs are not sent back to the connection they came from
        let guid = Guid::generate();
        router.on_message(Message::ping(guid, 3), as_handle(&b));
        assert!(b.sent().iter().all(|m| m.guid != guid || m.function_code() != FunctionCode::Pong));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_routed_back() {
        let (router, local) = router();
        let a = connect(&router);
        let b = connect(&router);

        let guid = Guid::generate();
        router.on_message(Message::ping(guid, 3), as_handle(&a));
        b.assert_message_sent(FunctionCode::Ping, guid);

        router.on_message(Message::new(guid, 2, Payload::Pong(pong(1))), as_handle(&b));
        let forwarded = a.assert_message_sent(FunctionCode::Pong, guid);
        assert_eq!((forwarded.ttl, forwarded.hops), (1, 1));

        // TTL exhausted
        router.on_message(Message::new(guid, 1, Payload::Pong(pong(2))), as_handle(&b));
        a.assert_no_remaining_messages();

        // unknown ping
        router.on_message(Message::new(Guid::generate(), 2, Payload::Pong(pong(3))), as_handle(&b));
        a.assert_no_remaining_messages();
        local.assert_no_remaining_messages();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_for_own_ping_delivered_locally() {
        let (router, local) = router();
        let a = connect(&router);

        let guid = router.send_ping(3);
        a.assert_message_sent(FunctionCode::Ping, guid);

        router.on_message(Message::new(guid, 1, Payload::Pong(pong(1))), as_handle(&a));
        local.assert_message_sent(FunctionCode::Pong, guid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_flooded_and_reply_routed() {
        let (router, _) = router();
        let a = connect(&router);
        let b = connect(&router);

        let guid = Guid::generate();
        let query = Message::new(guid, 4, Payload::Query(Query::new(0, "music")));
        router.on_message(query.clone(), as_handle(&a));
        router.on_message(query, as_handle(&b));
        b.assert_message_sent(FunctionCode::Query, guid);
        b.assert_no_remaining_messages();
        a.assert_no_remaining_messages();

        router.on_message(query_reply(guid, 3, Guid::generate(), 10), as_handle(&b));
        let forwarded = a.assert_message_sent(FunctionCode::QueryReply, guid);
        assert_eq!(forwarded.ttl, 2);

        let entry = router.query_routes.entry(&guid).unwrap();
        assert_eq!(entry.replies_routed, 1);
        assert_eq!(entry.bytes_routed, forwarded.total_len() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_byte_budget() {
        let mut config = config();
        config.max_reply_bytes_per_query = 4000;
        let (router, _) = router_with(config);
        let a = connect(&router);
        let b = connect(&router);

        let guid = Guid::generate();
        router.on_message(Message::new(guid, 4, Payload::Query(Query::new(0, "x"))), as_handle(&a));

        // replies with more than two hops left get a quarter of the budget: 1000 bytes
        for _ in 0..2 {
            router.on_message(query_reply(guid, 5, Guid::generate(), 600), as_handle(&b));
        }
        assert_eq!(a.sent().len(), 2);
        router.on_message(query_reply(guid, 5, Guid::generate(), 600), as_handle(&b));
        assert_eq!(a.sent().len(), 2);

        // ... but replies with a single hop left still fit
        router.on_message(query_reply(guid, 2, Guid::generate(), 600), as_handle(&b));
        assert_eq!(a.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_count_limit() {
        let mut config = config();
        config.max_replies_per_query = 2;
        let (router, _) = router_with(config);
        let a = connect(&router);
        let b = connect(&router);

        let guid = Guid::generate();
        router.on_message(Message::new(guid, 4, Payload::Query(Query::new(0, "x"))), as_handle(&a));
        for _ in 0..5 {
            router.on_message(query_reply(guid, 2, Guid::generate(), 0), as_handle(&b));
        }
        assert_eq!(a.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_for_own_query_are_never_dropped() {
        let mut config = config();
        config.max_replies_per_query = 0;
        let (router, local) = router_with(config);
        let a = connect(&router);

        let guid = router.send_query(3, 0, "abc");
        a.assert_message_sent(FunctionCode::Query, guid);

        for _ in 0..3 {
            router.on_message(query_reply(guid, 1, Guid::generate(), 100), as_handle(&a));
        }
        assert_eq!(local.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_routed_along_reply_path() {
        let (router, local) = router();
        let a = connect(&router);
        let b = connect(&router);

        let guid = Guid::generate();
        let servent_id = Guid::generate();
        router.on_message(Message::new(guid, 4, Payload::Query(Query::new(0, "x"))), as_handle(&a));
        b.assert_message_sent(FunctionCode::Query, guid);
        router.on_message(query_reply(guid, 3, servent_id, 0), as_handle(&b));
        a.assert_message_sent(FunctionCode::QueryReply, guid);

        let push = PushRequest::new(servent_id, 7, SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6346));
        let push_guid = Guid::generate();
        router.on_message(Message::new(push_guid, 3, Payload::Push(push)), as_handle(&a));
        b.assert_message_sent(FunctionCode::Push, push_guid);

        let push = PushRequest::new(router.client_guid(), 7, SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6346));
        let push_guid = Guid::generate();
        router.on_message(Message::new(push_guid, 3, Payload::Push(push)), as_handle(&a));
        local.assert_message_sent(FunctionCode::Push, push_guid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_reply_does_not_redirect_push_route() {
        let (router, _) = router();
        let a = connect(&router);
        let b = connect(&router);
        let intruder = connect(&router);

        let guid = Guid::generate();
        let servent_id = Guid::generate();
        router.on_message(Message::new(guid, 4, Payload::Query(Query::new(0, "x"))), as_handle(&a));
        b.assert_message_sent(FunctionCode::Query, guid);
        intruder.assert_message_sent(FunctionCode::Query, guid);
        router.on_message(query_reply(guid, 3, servent_id, 0), as_handle(&b));
        a.assert_message_sent(FunctionCode::QueryReply, guid);

        // a reply for a query nobody routed, claiming b's servent id
        router.on_message(query_reply(Guid::generate(), 3, servent_id, 0), as_handle(&intruder));
        a.assert_no_remaining_messages();

        let push = PushRequest::new(servent_id, 7, SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6346));
        let push_guid = Guid::generate();
        router.on_message(Message::new(push_guid, 3, Payload::Push(push)), as_handle(&a));
        b.assert_message_sent(FunctionCode::Push, push_guid);
        b.assert_no_remaining_messages();
        intruder.assert_no_remaining_messages();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_push() {
        let (router, _) = router();
        let a = connect(&router);
        let b = connect(&router);
        let servent_id = Guid::generate();
        let callback = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6346);

        // no route: broadcast
        assert!(router.send_push(PushRequest::new(servent_id, 1, callback)));
        assert_eq!(a.sent().len(), 1);
        assert_eq!(b.sent().len(), 1);

        let guid = Guid::generate();
        router.on_message(Message::new(guid, 4, Payload::Query(Query::new(0, "x"))), as_handle(&a));
        router.on_message(query_reply(guid, 3, servent_id, 0), as_handle(&b));

        assert!(router.send_push(PushRequest::new(servent_id, 1, callback)));
        let push = b.sent().last().unwrap().clone();
        assert_eq!(push.function_code(), FunctionCode::Push);
        assert_eq!(push.ttl, router.config.push_ttl);
        assert_eq!(b.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_closed() {
        let (router, _) = router();
        let a = connect(&router);
        let b = connect(&router);
        assert_eq!(router.num_connections(), 2);

        let guid = Guid::generate();
        router.on_message(Message::ping(guid, 3), as_handle(&a));
        b.assert_message_sent(FunctionCode::Ping, guid);

        router.connection_closed(a.key());
        assert_eq!(router.num_connections(), 1);

        router.on_message(Message::new(guid, 2, Payload::Pong(pong(1))), as_handle(&b));
        a.assert_no_remaining_messages();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_is_skipped_by_broadcast() {
        let (router, _) = router();
        let a = connect(&router);
        let b = connect(&router);
        b.set_open(false);

        router.send_ping(2);
        assert_eq!(a.sent().len(), 1);
        assert!(b.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_datagram_push() {
        let (router, local) = router();
        let a = connect(&router);
        let b = connect(&router);
        let callback = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6346);

        // unknown servent
        router.on_datagram(Message::new(Guid::generate(), 3, Payload::Push(PushRequest::new(Guid::generate(), 1, callback))));
        local.assert_no_remaining_messages();

        let guid = Guid::generate();
        router.on_datagram(Message::new(guid, 1, Payload::Push(PushRequest::new(router.client_guid(), 1, callback))));
        local.assert_message_sent(FunctionCode::Push, guid);

        // acting as a push proxy for a servent whose replies went through b
        let query_guid = Guid::generate();
        let servent_id = Guid::generate();
        router.on_message(Message::new(query_guid, 4, Payload::Query(Query::new(0, "x"))), as_handle(&a));
        router.on_message(query_reply(query_guid, 3, servent_id, 0), as_handle(&b));
        b.assert_message_sent(FunctionCode::Query, query_guid);

        let guid = Guid::generate();
        router.on_datagram(Message::new(guid, 3, Payload::Push(PushRequest::new(servent_id, 1, callback))));
        b.assert_message_sent(FunctionCode::Push, guid);

        router.on_datagram(Message::ping(Guid::generate(), 3));
        a.assert_message_sent(FunctionCode::QueryReply, query_guid);
        a.assert_no_remaining_messages();
        b.assert_no_remaining_messages();
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_protocol_pongs_not_cached() {
        let (router, _) = router();
        let old = TrackingConnection::with_version(ProtocolVersion { major: 0, minor: 4 });
        router.connection_opened(as_handle(&old));

        router.on_message(Message::new(Guid::generate(), 2, Payload::Pong(pong(1))), as_handle(&old));
        assert!(router.reply_cache.is_empty());
    }
}
